//! Fixed-size, NUL-terminated text fields inside records.

/// Copy `value` into `field`, truncating so a terminating NUL always fits
pub fn set_cstr(field: &mut [u8], value: &str) {
    field.fill(0);
    if field.is_empty() {
        return;
    }
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Text up to the first NUL
pub fn cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
