//! Directive header parsing for submitted scripts.
//!
//! A script carries its scheduling metadata in `#PBS -<letter> <value>`
//! lines, e.g.:
//!
//! ```text
//! #PBS -N reduce-night-42
//! #PBS -l ncpus=20
//! #PBS -o reduce.output
//! #PBS -e reduce.error
//! #PBS -m a
//! #PBS -M ops@example.org
//! ```
//!
//! The scan is line-oriented over the whole file: directives may appear
//! anywhere, not just at the top, and lines inside heredocs count too. The
//! parser records whatever it finds; presence and type checks happen at
//! submit time in [`job_request`].

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;

use crate::error::PybsError;
use crate::jobstore::NewJob;

/// Parsed directive map. Keys follow the directive table: `N` fills `name`,
/// `l` fills the key left of its `=`, `e`/`o` fill `error`/`output`, `m`
/// fills `send_mail`, `M` fills `email`, `p` fills `priority`. A repeated
/// directive overwrites the earlier value.
#[derive(Debug, Default, Clone)]
pub struct Header {
    values: HashMap<String, String>,
}

impl Header {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name")
    }

    pub fn output(&self) -> Option<&str> {
        self.get("output")
    }

    pub fn error(&self) -> Option<&str> {
        self.get("error")
    }

    pub fn send_mail(&self) -> Option<&str> {
        self.get("send_mail")
    }

    pub fn email(&self) -> Option<&str> {
        self.get("email")
    }

    pub fn nodes(&self) -> Option<&str> {
        self.get("nodes")
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Scan `path` for `#PBS -<letter> <value>` lines and collect them.
///
/// Non-matching lines (blank lines, script content, comments) are ignored;
/// the scan stops only at end of file.
pub fn parse_header(path: &Path) -> std::io::Result<Header> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_header_str(&contents))
}

fn parse_header_str(contents: &str) -> Header {
    let mut values = HashMap::new();

    for line in contents.lines() {
        let Some(rest) = line.strip_prefix("#PBS -") else {
            continue;
        };
        // One ASCII letter, one space, then the value (which may be empty).
        let mut chars = rest.chars();
        let letter = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => c,
            _ => continue,
        };
        if chars.next() != Some(' ') {
            continue;
        }
        let value = &rest[2..];

        match letter {
            'N' => {
                values.insert("name".to_string(), value.to_string());
            }
            'l' => {
                // Resource list: split on the first '=' (`ncpus=20` yields
                // key "ncpus"). A value without '=' is not a resource.
                if let Some((key, val)) = value.split_once('=') {
                    values.insert(key.to_string(), val.to_string());
                }
            }
            'e' => {
                values.insert("error".to_string(), value.to_string());
            }
            'o' => {
                values.insert("output".to_string(), value.to_string());
            }
            'm' => {
                values.insert("send_mail".to_string(), value.to_string());
            }
            'M' => {
                values.insert("email".to_string(), value.to_string());
            }
            'p' => {
                values.insert("priority".to_string(), value.to_string());
            }
            _ => {}
        }
    }

    Header { values }
}

/// Build a [`NewJob`] for `submit` from a script under `root`.
///
/// This is where the acceptance rule lives: a script is accepted iff its
/// header yields at least `name` and `ncpus`, `ncpus` parses to a positive
/// integer, and `priority` (when present) parses to an integer.
pub fn job_request(path: &Path, root: &Path, username: &str) -> Result<NewJob, PybsError> {
    let header =
        parse_header(path).map_err(|e| PybsError::validation(format!("cannot read script: {e}")))?;

    let name = match header.name() {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => return Err(PybsError::validation("no job name given in header")),
    };

    let ncpus: i32 = header
        .get("ncpus")
        .ok_or_else(|| PybsError::validation("no ncpus given in header"))?
        .parse()
        .map_err(|_| PybsError::validation("ncpus is not an integer"))?;
    if ncpus < 1 {
        return Err(PybsError::validation("ncpus must be at least 1"));
    }

    let priority: i32 = match header.get("priority") {
        None => 0,
        Some(p) => p
            .parse()
            .map_err(|_| PybsError::validation("priority is not an integer"))?,
    };

    let filename = path
        .strip_prefix(root)
        .map_err(|_| PybsError::validation("script is not under the configured root"))?
        .to_string_lossy()
        .into_owned();

    Ok(NewJob {
        name,
        username: username.to_string(),
        filename,
        ncpus,
        priority,
        nodes: header.nodes().map(str::to_string),
        submitted: Utc::now(),
    })
}
