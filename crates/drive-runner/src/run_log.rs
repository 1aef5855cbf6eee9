//! Structured run log: one JSON object per line, each tagged by a single key
//! (`Loading`, `Iterating`, `Error`, `Finished`, ...) whose value is the
//! payload. The status monitor reads the same stream back.

use crate::ensure_dir;
use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub tag: String,
    pub payload: Value,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `{tag: payload}`. When `iteration` is given it is stored in the
    /// payload under `Iteration`, which is what progress readers look at.
    pub fn add_message(&self, tag: &str, payload: Value, iteration: Option<u64>) -> Result<()> {
        let mut payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("Value".to_string(), other);
                map
            }
        };
        if let Some(iteration) = iteration {
            payload.insert("Iteration".to_string(), json!(iteration));
        }
        let mut entry = Map::new();
        entry.insert(tag.to_string(), Value::Object(payload));
        let mut line = serde_json::to_string(&Value::Object(entry))?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Every complete entry in the log, oldest first. A trailing line that
    /// does not parse is treated as an in-flight write and skipped; an
    /// unparseable line in the middle is corruption and fails the read. A
    /// write cut inside a multibyte character only spoils its own line.
    pub fn read_entries(path: &Path) -> Result<Vec<RunLogEntry>> {
        let data = fs::read(path)?;
        let lines: Vec<&[u8]> = data
            .split(|b| *b == b'\n')
            .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
            .collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match parse_entry(line) {
                Some(entry) => entries.push(entry),
                None if idx + 1 == lines.len() => break,
                None => {
                    return Err(anyhow!(
                        "corrupt_run_log: line {} of {} is not a tagged entry",
                        idx + 1,
                        path.display()
                    ))
                }
            }
        }
        Ok(entries)
    }
}

fn parse_entry(line: &[u8]) -> Option<RunLogEntry> {
    let line = std::str::from_utf8(line).ok()?;
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (tag, payload) = map.iter().next()?;
    Some(RunLogEntry {
        tag: tag.clone(),
        payload: payload.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;

    #[test]
    fn add_message_appends_tagged_lines() {
        let root = temp_root("run_log_append");
        let log = RunLog::new(root.join("_logs").join("b").join("e").join("drive_S_T"));
        log.add_message("Loading", json!({"Poses": [[1, 2]]}), None)
            .expect("loading");
        log.add_message("Iterating", json!({"Checkpoint": 100}), Some(100))
            .expect("iterating");
        log.add_message("Finished", Value::Null, None).expect("finished");

        let entries = RunLog::read_entries(log.path()).expect("read");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].tag, "Loading");
        assert_eq!(entries[1].payload["Iteration"], json!(100));
        assert_eq!(entries[1].payload["Checkpoint"], json!(100));
        assert_eq!(entries[2].payload, json!({}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn partial_trailing_line_is_skipped_but_middle_corruption_fails() {
        let root = temp_root("run_log_partial");
        let path = root.join("log");
        fs::write(
            &path,
            "{\"Loading\": {}}\n{\"Iterating\": {\"Iteration\": 5}}\n{\"Iterat",
        )
        .expect("write");
        let entries = RunLog::read_entries(&path).expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].tag, "Iterating");

        fs::write(&path, "{\"Loading\": {}}\ngarbage\n{\"Error\": {}}\n").expect("write");
        let err = RunLog::read_entries(&path).expect_err("corrupt");
        assert!(err.to_string().contains("corrupt_run_log"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn write_cut_inside_multibyte_character_is_a_partial_line() {
        let root = temp_root("run_log_utf8_tail");
        let path = root.join("log");
        let mut data = b"{\"Iterating\": {\"Iteration\": 10}}\n".to_vec();
        data.extend_from_slice(b"{\"Error\": {\"Detail\": \"caf");
        data.push(0xC3);
        fs::write(&path, &data).expect("write");
        let entries = RunLog::read_entries(&path).expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag, "Iterating");
        assert_eq!(entries[0].payload["Iteration"], json!(10));

        let mut data = b"{\"Loading\": {}}\n{\"Error\": {\"Detail\": \"caf".to_vec();
        data.extend_from_slice(&[0xC3, b'"', b'}', b'}', b'\n']);
        data.extend_from_slice(b"{\"Finished\": {}}\n");
        fs::write(&path, &data).expect("write");
        let err = RunLog::read_entries(&path).expect_err("invalid utf-8 mid-log");
        assert!(err.to_string().contains("corrupt_run_log"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
