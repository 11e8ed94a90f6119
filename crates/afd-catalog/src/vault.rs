//! Password vault (`fifodir/pwb.data`).
//!
//! Maps `user@host` to an obscured password. The obscured form carries a
//! three-byte tag naming its encoding:
//!
//! * `$0$` plain text
//! * `$1$` position-dependent substitution (the default)
//! * `$2$` XOR with a rotating key
//!
//! Records without a tag predate tagging and are read as `$1$`. Passwords
//! are stored as they appear in the recipient URL, so retrieval
//! percent-decodes them unless the caller wants the URL form back.

use std::path::PathBuf;

use afd_config::{log_catalog_debug, log_catalog_warn};
use afd_status::text::{cstr, set_cstr};
use afd_status::{AreaSpec, LockKind, LockWait, MappedArea, Record};
use percent_encoding::percent_decode_str;

use crate::{CatalogError, Result};

pub const PWB_VERSION: u8 = 1;
pub const PWB_STEP_SIZE: usize = 10;
pub const MAX_USER_NAME_LENGTH: usize = 96;
pub const MAX_PASSWD_BUFFER: usize = 80;

const TAG_LEN: usize = 3;
const XOR_KEY: &[u8] = b"Ad9$fQ7z!pW3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordMode {
    Plain,
    Internal,
    Xor,
}

impl PasswordMode {
    fn tag(self) -> &'static [u8; TAG_LEN] {
        match self {
            PasswordMode::Plain => b"$0$",
            PasswordMode::Internal => b"$1$",
            PasswordMode::Xor => b"$2$",
        }
    }

    fn from_tag(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"$0$" => Some(PasswordMode::Plain),
            b"$1$" => Some(PasswordMode::Internal),
            b"$2$" => Some(PasswordMode::Xor),
            _ => None,
        }
    }

    fn encode(self, plain: &[u8]) -> Vec<u8> {
        match self {
            PasswordMode::Plain => plain.to_vec(),
            PasswordMode::Internal => plain
                .iter()
                .enumerate()
                .map(|(i, &b)| {
                    let shift = if i % 2 == 0 { 24u8 } else { 11u8 };
                    b.wrapping_sub(shift).wrapping_add(i as u8)
                })
                .collect(),
            PasswordMode::Xor => xor(plain),
        }
    }

    fn decode(self, stored: &[u8]) -> Vec<u8> {
        match self {
            PasswordMode::Plain => stored.to_vec(),
            PasswordMode::Internal => stored
                .iter()
                .enumerate()
                .map(|(i, &b)| {
                    let shift = if i % 2 == 0 { 24u8 } else { 11u8 };
                    b.wrapping_add(shift).wrapping_sub(i as u8)
                })
                .collect(),
            PasswordMode::Xor => xor(stored),
        }
    }
}

fn xor(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ XOR_KEY[i % XOR_KEY.len()] ^ (i as u8))
        .collect()
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PasswordRecord {
    pub uh_name: [u8; MAX_USER_NAME_LENGTH],
    pub passwd: [u8; MAX_PASSWD_BUFFER],
    /// Bytes used in `passwd`, tag included
    pub passwd_len: u8,
    pub dup_check: u8,
    pub _pad: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<PasswordRecord>() == 180);

unsafe impl Record for PasswordRecord {}

impl PasswordRecord {
    pub fn uh_name(&self) -> String {
        cstr(&self.uh_name)
    }

    fn stored(&self) -> &[u8] {
        &self.passwd[..(self.passwd_len as usize).min(MAX_PASSWD_BUFFER)]
    }

    /// Password in URL form
    pub fn reveal(&self) -> String {
        let stored = self.stored();
        let (mode, body) = match stored.get(..TAG_LEN).and_then(PasswordMode::from_tag) {
            Some(mode) => (mode, &stored[TAG_LEN..]),
            None => (PasswordMode::Internal, stored),
        };
        String::from_utf8_lossy(&mode.decode(body)).into_owned()
    }
}

/// What [`PasswordVault::store`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Added,
    Unchanged,
    /// Replaced a password stored by an earlier configuration pass
    Replaced,
    /// A second, different password in the same pass; it replaced the first
    Conflict,
}

fn uh_name(user: &str, host: &str) -> String {
    format!("{}@{}", user, host)
}

#[derive(Debug)]
pub struct PasswordVault {
    area: MappedArea,
    mode: PasswordMode,
}

impl PasswordVault {
    pub fn attach(path: impl Into<PathBuf>) -> Result<Self> {
        let spec = AreaSpec::new(PWB_STEP_SIZE, PasswordRecord::SIZE, PWB_VERSION);
        let area = MappedArea::attach(&path.into(), &spec)?;
        // Byte 1 stays locked until the first read so two starting
        // processes cannot both act on a half-initialized vault
        let guard = area.lock_region(1, 1, LockKind::Exclusive)?;
        let count = area.count();
        drop(guard);
        log_catalog_debug!("Attached password vault", records = count);
        Ok(Self {
            area,
            mode: PasswordMode::Internal,
        })
    }

    pub fn with_mode(mut self, mode: PasswordMode) -> Self {
        self.mode = mode;
        self
    }

    /// Start a configuration pass: no password counts as seen yet
    pub fn begin_pass(&mut self) -> Result<()> {
        let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        for pos in 0..self.area.count() {
            let mut record: PasswordRecord = self.area.read(pos)?;
            if record.dup_check != 0 {
                record.dup_check = 0;
                self.area.write(pos, &record)?;
            }
        }
        Ok(())
    }

    pub fn store(&mut self, user: &str, host: &str, password: &str) -> Result<StoreOutcome> {
        let name = uh_name(user, host);
        if name.len() >= MAX_USER_NAME_LENGTH {
            return Err(CatalogError::Vault(format!("user and host name too long: {}", name)));
        }
        if password.len() + TAG_LEN > MAX_PASSWD_BUFFER {
            return Err(CatalogError::Vault(format!("password for {} too long", name)));
        }

        let mut encoded = self.mode.tag().to_vec();
        encoded.extend(self.mode.encode(password.as_bytes()));

        let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        let records: Vec<PasswordRecord> = self.area.records();
        let existing = records.iter().position(|r| r.uh_name() == name);

        let mut record = match existing {
            Some(pos) => records[pos],
            None => {
                let mut fresh = PasswordRecord::zeroed();
                set_cstr(&mut fresh.uh_name, &name);
                fresh
            }
        };

        let outcome = match existing {
            None => StoreOutcome::Added,
            Some(_) if record.reveal() == password => StoreOutcome::Unchanged,
            Some(_) if record.dup_check != 0 => {
                log_catalog_warn!(
                    "Different passwords for the same user and host, taking the later one",
                    uh_name = name.as_str()
                );
                StoreOutcome::Conflict
            }
            Some(_) => StoreOutcome::Replaced,
        };

        if outcome != StoreOutcome::Unchanged {
            record.passwd = [0; MAX_PASSWD_BUFFER];
            record.passwd[..encoded.len()].copy_from_slice(&encoded);
            record.passwd_len = encoded.len() as u8;
        }
        record.dup_check = 1;

        match existing {
            Some(pos) => self.area.write(pos, &record)?,
            None => {
                self.area.push(&record)?;
            }
        }
        self.area.flush()?;
        Ok(outcome)
    }

    /// Password for `user@host`. With `url_conformant` the stored URL form
    /// is returned, otherwise it is percent-decoded.
    pub fn get(&self, user: &str, host: &str, url_conformant: bool) -> Result<Option<String>> {
        let name = uh_name(user, host);
        let _lock = self.area.lock_whole(LockKind::Shared, LockWait::Wait)?;
        let found = self
            .area
            .records::<PasswordRecord>()
            .into_iter()
            .find(|r| r.uh_name() == name);
        Ok(found.map(|r| {
            let raw = r.reveal();
            if url_conformant {
                raw
            } else {
                percent_decode_str(&raw).decode_utf8_lossy().into_owned()
            }
        }))
    }

    pub fn len(&self) -> usize {
        self.area.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_encoding_is_position_dependent() {
        let stored = PasswordMode::Internal.encode(b"aaaa");
        assert_eq!(stored, vec![b'a' - 24, b'a' - 11 + 1, b'a' - 24 + 2, b'a' - 11 + 3]);
        assert_eq!(PasswordMode::Internal.decode(&stored), b"aaaa");
    }

    #[test]
    fn test_modes_round_trip() {
        for mode in [PasswordMode::Plain, PasswordMode::Internal, PasswordMode::Xor] {
            let secret = b"s3cr\x01t%40pw";
            assert_eq!(mode.decode(&mode.encode(secret)), secret);
        }
        assert_ne!(PasswordMode::Xor.encode(b"abc"), b"abc".to_vec());
    }

    #[test]
    fn test_untagged_record_reads_as_internal() {
        let mut record = PasswordRecord::zeroed();
        let body = PasswordMode::Internal.encode(b"legacy");
        record.passwd[..body.len()].copy_from_slice(&body);
        record.passwd_len = body.len() as u8;
        assert_eq!(record.reveal(), "legacy");
    }

    #[test]
    fn test_store_and_get() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pwb.data");
        let mut vault = PasswordVault::attach(&path).unwrap();
        assert_eq!(vault.store("u", "h", "p%40ss").unwrap(), StoreOutcome::Added);
        assert_eq!(vault.get("u", "h", false).unwrap().as_deref(), Some("p@ss"));
        assert_eq!(vault.get("u", "h", true).unwrap().as_deref(), Some("p%40ss"));
        assert_eq!(vault.get("u", "other", false).unwrap(), None);

        let vault = PasswordVault::attach(&path).unwrap().with_mode(PasswordMode::Xor);
        assert_eq!(vault.get("u", "h", false).unwrap().as_deref(), Some("p@ss"));
    }

    #[test]
    fn test_dup_check_within_and_across_passes() {
        let temp = tempfile::tempdir().unwrap();
        let mut vault = PasswordVault::attach(temp.path().join("pwb.data")).unwrap();

        vault.begin_pass().unwrap();
        assert_eq!(vault.store("u", "h", "one").unwrap(), StoreOutcome::Added);
        assert_eq!(vault.store("u", "h", "one").unwrap(), StoreOutcome::Unchanged);
        assert_eq!(vault.store("u", "h", "two").unwrap(), StoreOutcome::Conflict);
        assert_eq!(vault.get("u", "h", false).unwrap().as_deref(), Some("two"));

        vault.begin_pass().unwrap();
        assert_eq!(vault.store("u", "h", "three").unwrap(), StoreOutcome::Replaced);
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn test_rejects_oversized_password() {
        let temp = tempfile::tempdir().unwrap();
        let mut vault = PasswordVault::attach(temp.path().join("pwb.data")).unwrap();
        let long = "x".repeat(MAX_PASSWD_BUFFER);
        assert!(matches!(vault.store("u", "h", &long), Err(CatalogError::Vault(_))));
        assert!(vault.is_empty());
    }
}
