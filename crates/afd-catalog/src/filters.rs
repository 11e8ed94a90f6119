//! Per-directory filter files (`files/incoming/filters/<dir-alias>`).
//!
//! The full file-mask set of one directory so the scanner can match without
//! reparsing DIR_CONFIG:
//!
//! ```text
//! <groups:i32> { <masks:i32><mask-bytes:i32><mask_0>\0..<mask_n>\0 }*
//! ```

use std::fs;
use std::path::Path;

use crate::matcher::FileGroup;
use crate::{CatalogError, Result};

pub fn encode(groups: &[FileGroup]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(groups.len() as i32).to_ne_bytes());
    for group in groups {
        let mut block = Vec::new();
        for mask in &group.masks {
            block.extend_from_slice(mask.as_bytes());
            block.push(0);
        }
        out.extend_from_slice(&(group.masks.len() as i32).to_ne_bytes());
        out.extend_from_slice(&(block.len() as i32).to_ne_bytes());
        out.extend_from_slice(&block);
    }
    out
}

/// Decode a filter file. Group names are not stored; groups are numbered.
pub fn decode(buf: &[u8]) -> Result<Vec<FileGroup>> {
    let corrupt = |what: &str| CatalogError::Corrupt(format!("filter file: {}", what));
    let mut pos = 0usize;
    let int = |pos: &mut usize| -> Result<i32> {
        let raw = buf.get(*pos..*pos + 4).ok_or_else(|| corrupt("truncated"))?;
        *pos += 4;
        Ok(i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
    };

    let groups = int(&mut pos)?;
    if groups < 0 {
        return Err(corrupt("negative group count"));
    }
    let mut out = Vec::with_capacity(groups as usize);
    for n in 0..groups {
        let count = int(&mut pos)?;
        let bytes = int(&mut pos)?;
        if count < 0 || bytes < 0 {
            return Err(corrupt("negative length"));
        }
        let block = buf
            .get(pos..pos + bytes as usize)
            .ok_or_else(|| corrupt("truncated masks"))?;
        pos += bytes as usize;
        let masks: Vec<String> = block
            .split(|&b| b == 0)
            .take(count as usize)
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect();
        if masks.len() != count as usize {
            return Err(corrupt("mask count mismatch"));
        }
        out.push(FileGroup::new(n.to_string(), masks));
    }
    Ok(out)
}

pub fn write(path: &Path, groups: &[FileGroup]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, encode(groups))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<FileGroup>> {
    decode(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let groups = vec![
            FileGroup::new("a", vec!["*.bin".into()]),
            FileGroup::new("b", vec![]),
        ];
        let bytes = encode(&groups);
        let mut expect = Vec::new();
        expect.extend_from_slice(&2i32.to_ne_bytes());
        expect.extend_from_slice(&1i32.to_ne_bytes());
        expect.extend_from_slice(&6i32.to_ne_bytes());
        expect.extend_from_slice(b"*.bin\0");
        expect.extend_from_slice(&0i32.to_ne_bytes());
        expect.extend_from_slice(&0i32.to_ne_bytes());
        assert_eq!(bytes, expect);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded[0].masks, groups[0].masks);
        assert!(decoded[1].masks.is_empty());
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let bytes = encode(&[FileGroup::new("a", vec!["*".into()])]);
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Err(CatalogError::Corrupt(_))));
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_write_and_read() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("filters").join("in1");
        write(&path, &[FileGroup::new("g", vec!["!x*".into(), "*".into()])]).unwrap();
        let groups = read(&path).unwrap();
        assert_eq!(groups[0].masks, vec!["!x*", "*"]);
    }
}
