//! Local options: transformations applied inside a message directory
//! before the message is queued.

use std::fs;
use std::path::Path;
use std::process::Command;

use afd_config::log_amg_debug;

use crate::fsops::list_files;
use crate::{AmgError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOption {
    ToUpper,
    ToLower,
    PrefixAdd(String),
    PrefixDel(String),
    /// Cut everything from the first `.`
    Basename,
    ExtensionAdd(String),
    ExtensionDel,
    /// Shell command run once per file, `%s` is the file name
    Exec(String),
    Delete,
    /// Rename rules are not evaluated; files keep their names
    Rename(String),
    Unknown(String),
}

impl LocalOption {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (keyword, rest) = match text.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (text, ""),
        };
        let arg = |sub: &str| -> Option<String> {
            rest.strip_prefix(sub)
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
        };
        match keyword {
            "toupper" => Self::ToUpper,
            "tolower" => Self::ToLower,
            "basename" => Self::Basename,
            "delete" => Self::Delete,
            "prefix" => match (arg("add"), arg("del")) {
                (Some(p), _) => Self::PrefixAdd(p),
                (_, Some(p)) => Self::PrefixDel(p),
                _ => Self::Unknown(text.to_string()),
            },
            "extension" => match arg("add") {
                Some(e) => Self::ExtensionAdd(e),
                None if rest.starts_with("del") => Self::ExtensionDel,
                None => Self::Unknown(text.to_string()),
            },
            "exec" if !rest.is_empty() => Self::Exec(rest.to_string()),
            "rename" | "srename" => Self::Rename(rest.to_string()),
            _ => Self::Unknown(text.to_string()),
        }
    }

    fn new_name(&self, name: &str) -> Option<String> {
        let renamed = match self {
            Self::ToUpper => name.to_uppercase(),
            Self::ToLower => name.to_lowercase(),
            Self::PrefixAdd(p) => format!("{}{}", p, name),
            Self::PrefixDel(p) => name.strip_prefix(p.as_str())?.to_string(),
            Self::Basename => match name.find('.') {
                Some(i) if i > 0 => name[..i].to_string(),
                _ => return None,
            },
            Self::ExtensionAdd(e) => format!("{}.{}", name, e.trim_start_matches('.')),
            Self::ExtensionDel => match name.rfind('.') {
                Some(i) if i > 0 => name[..i].to_string(),
                _ => return None,
            },
            _ => return None,
        };
        (renamed != name && !renamed.is_empty()).then_some(renamed)
    }
}

/// Result of running the local options over one message
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Applied {
    /// Files left in the message, (name, size)
    pub files: Vec<(String, u64)>,
    /// Files removed by a `delete` option
    pub deleted: Vec<(String, u64)>,
    /// Options that were skipped
    pub ignored: Vec<String>,
}

fn run_exec(cmd: &str, dir: &Path, name: &str) -> Result<()> {
    let line = cmd.replace("%s", name);
    let status = Command::new("sh")
        .arg("-c")
        .arg(&line)
        .current_dir(dir)
        .status()?;
    if !status.success() {
        return Err(AmgError::Option {
            option: format!("exec {}", cmd),
            reason: format!("`{}` exited with {}", line, status),
        });
    }
    Ok(())
}

/// Run `options` over the files of message directory `dir`, in order
pub fn apply(options: &[String], dir: &Path, mut files: Vec<(String, u64)>) -> Result<Applied> {
    let mut applied = Applied::default();
    for text in options {
        let option = LocalOption::parse(text);
        match &option {
            LocalOption::Delete => {
                for (name, size) in files.drain(..) {
                    fs::remove_file(dir.join(&name))?;
                    applied.deleted.push((name, size));
                }
            }
            LocalOption::Exec(cmd) => {
                for (name, _) in &files {
                    run_exec(cmd, dir, name)?;
                }
                files = list_files(dir)?;
            }
            LocalOption::Rename(_) | LocalOption::Unknown(_) => {
                applied.ignored.push(text.clone());
            }
            _ => {
                for (name, _) in files.iter_mut() {
                    if let Some(new) = option.new_name(name) {
                        fs::rename(dir.join(&*name), dir.join(&new))?;
                        log_amg_debug!("Local option renamed file", from = name.as_str(), to = new.as_str());
                        *name = new;
                    }
                }
                files.sort();
                files.dedup_by(|a, b| a.0 == b.0);
            }
        }
    }
    applied.files = files;
    Ok(applied)
}
