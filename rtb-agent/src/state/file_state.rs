//! Last-known backed-up state of a single file, and its batch line format.
//!
//! A line is `checksum size ticks contentKey path`, space separated, path
//! last so it may contain spaces. `ticks` counts 100ns intervals since
//! 0001-01-01T00:00:00Z.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::fs::File;
use std::path::Path;

use crate::fs::checksum::Checksum;
use crate::utils::errors::{AgentError, Result};

/// Stands in for an empty content key so the field count never changes.
const EMPTY_CONTENT_KEY_TOKEN: &str = "\"\"";

/// Checksum field of a removal record.
const TOMBSTONE_CHECKSUM: &str = "-";

/// Ticks between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

const TICKS_PER_SECOND: i64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub path: String,
    pub content_key: String,
    pub file_size: u64,
    pub last_modified_utc: DateTime<Utc>,
    pub checksum: String,
}

impl FileState {
    /// Capture the current state of a file on disk.
    pub fn from_file(path: &str, checksum: &dyn Checksum) -> Result<Self> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;

        Ok(Self {
            path: path.to_string(),
            content_key: String::new(),
            file_size: metadata.len(),
            last_modified_utc: DateTime::<Utc>::from(metadata.modified()?),
            checksum: checksum.compute_checksum(&mut file)?,
        })
    }

    /// Whether the file on disk still has this size and content.
    pub fn is_match(&self, checksum: &dyn Checksum) -> Result<bool> {
        let mut file = match File::open(Path::new(&self.path)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if file.metadata()?.len() != self.file_size {
            return Ok(false);
        }

        Ok(checksum.compute_checksum(&mut file)? == self.checksum)
    }

    /// Serialize to one batch line, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        if self.path.contains('\n') {
            return Err(AgentError::Format(format!(
                "path contains a newline character: {:?}",
                self.path
            )));
        }

        if self.checksum.is_empty() || self.checksum.contains(char::is_whitespace) {
            return Err(AgentError::Format(format!(
                "checksum must be a single non-empty token: {:?}",
                self.checksum
            )));
        }

        let content_key = if self.content_key.trim().is_empty() {
            EMPTY_CONTENT_KEY_TOKEN
        } else if self.content_key.contains(char::is_whitespace) {
            return Err(AgentError::Format(format!(
                "content key contains whitespace: {:?}",
                self.content_key
            )));
        } else {
            self.content_key.as_str()
        };

        Ok(format!(
            "{} {} {} {} {}",
            self.checksum,
            self.file_size,
            to_ticks(&self.last_modified_utc)?,
            content_key,
            self.path
        ))
    }

    /// Parse one batch line. Splits on the first four spaces only.
    pub fn parse(line: &str) -> Result<Self> {
        match BatchRecord::parse(line)? {
            BatchRecord::State(state) => Ok(state),
            BatchRecord::Removed(path) => Err(AgentError::Format(format!(
                "expected a file state, found a removal record for {}",
                path
            ))),
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes, {})", self.path, self.file_size, self.checksum)
    }
}

/// One line of a batch: either a state or the removal of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRecord {
    State(FileState),
    Removed(String),
}

impl BatchRecord {
    pub fn path(&self) -> &str {
        match self {
            BatchRecord::State(state) => &state.path,
            BatchRecord::Removed(path) => path,
        }
    }

    pub fn to_line(&self) -> Result<String> {
        match self {
            BatchRecord::State(state) => state.to_line(),
            BatchRecord::Removed(path) => {
                if path.contains('\n') {
                    return Err(AgentError::Format(format!(
                        "path contains a newline character: {:?}",
                        path
                    )));
                }
                Ok(format!(
                    "{} 0 0 {} {}",
                    TOMBSTONE_CHECKSUM, EMPTY_CONTENT_KEY_TOKEN, path
                ))
            }
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.splitn(5, ' ').collect();
        if parts.len() != 5 {
            return Err(AgentError::Format(format!(
                "expected 5 fields in batch line, found {}: {:?}",
                parts.len(),
                line
            )));
        }

        let path = parts[4].to_string();
        if parts[0] == TOMBSTONE_CHECKSUM {
            return Ok(BatchRecord::Removed(path));
        }

        let file_size = parts[1]
            .parse::<u64>()
            .map_err(|e| AgentError::Format(format!("bad size {:?}: {}", parts[1], e)))?;
        let ticks = parts[2]
            .parse::<i64>()
            .map_err(|e| AgentError::Format(format!("bad ticks {:?}: {}", parts[2], e)))?;
        let content_key = if parts[3] == EMPTY_CONTENT_KEY_TOKEN {
            String::new()
        } else {
            parts[3].to_string()
        };

        Ok(BatchRecord::State(FileState {
            path,
            content_key,
            file_size,
            last_modified_utc: from_ticks(ticks)?,
            checksum: parts[0].to_string(),
        }))
    }
}

pub fn to_ticks(time: &DateTime<Utc>) -> Result<i64> {
    let sub_ticks = i64::from(time.timestamp_subsec_nanos() / 100);
    time.timestamp()
        .checked_mul(TICKS_PER_SECOND)
        .and_then(|ticks| ticks.checked_add(UNIX_EPOCH_TICKS))
        .and_then(|ticks| ticks.checked_add(sub_ticks))
        .ok_or_else(|| AgentError::Format(format!("time out of tick range: {}", time)))
}

pub fn from_ticks(ticks: i64) -> Result<DateTime<Utc>> {
    let out_of_range = || AgentError::Format(format!("ticks out of range: {}", ticks));
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS).ok_or_else(out_of_range)?;
    let seconds = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;

    Utc.timestamp_opt(seconds, nanos)
        .single()
        .ok_or_else(out_of_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::checksum::Blake3Checksum;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample() -> FileState {
        FileState {
            path: "/home/user/My Documents/report final.txt".to_string(),
            content_key: "4f1c2a".to_string(),
            file_size: 1234,
            last_modified_utc: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn test_line_field_order() {
        let line = sample().to_line().unwrap();
        let parts: Vec<&str> = line.splitn(5, ' ').collect();

        assert_eq!(parts[0], "ab".repeat(32));
        assert_eq!(parts[1], "1234");
        assert_eq!(parts[2], "638448930000000000");
        assert_eq!(parts[3], "4f1c2a");
        assert_eq!(parts[4], "/home/user/My Documents/report final.txt");
    }

    #[test]
    fn test_parse_keeps_spaces_in_path() {
        let state = sample();
        let parsed = FileState::parse(&state.to_line().unwrap()).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_empty_content_key_placeholder() {
        let mut state = sample();
        state.content_key = String::new();

        let line = state.to_line().unwrap();
        assert!(line.contains(" \"\" /home/"));
        assert_eq!(FileState::parse(&line).unwrap().content_key, "");
    }

    #[test]
    fn test_newline_in_path_is_rejected() {
        let mut state = sample();
        state.path = "/tmp/evil\nname".to_string();

        assert!(matches!(state.to_line(), Err(AgentError::Format(_))));
        assert!(BatchRecord::Removed(state.path).to_line().is_err());
    }

    #[test]
    fn test_removal_record() {
        let record = BatchRecord::Removed("/srv/old file".to_string());
        let line = record.to_line().unwrap();

        assert_eq!(line, "- 0 0 \"\" /srv/old file");
        assert_eq!(BatchRecord::parse(&line).unwrap(), record);
        assert!(FileState::parse(&line).is_err());
    }

    #[test]
    fn test_rejects_short_line() {
        assert!(BatchRecord::parse("abc 12 34").is_err());
        assert!(BatchRecord::parse("abc twelve 34 \"\" /x").is_err());
    }

    #[test]
    fn test_ticks_keep_sub_second_precision() {
        let time = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
        assert_eq!(from_ticks(to_ticks(&time).unwrap()).unwrap(), time);
        assert_eq!(to_ticks(&Utc.timestamp_opt(0, 0).unwrap()).unwrap(), UNIX_EPOCH_TICKS);
    }

    #[test]
    fn test_out_of_range_ticks_are_errors() {
        assert!(matches!(from_ticks(i64::MIN), Err(AgentError::Format(_))));
        assert!(matches!(from_ticks(i64::MAX), Err(AgentError::Format(_))));
        assert!(matches!(to_ticks(&DateTime::<Utc>::MAX_UTC), Err(AgentError::Format(_))));
        assert!(BatchRecord::parse("abc 1 -9223372036854775808 \"\" /x").is_err());
    }

    #[test]
    fn test_content_key_with_whitespace_is_rejected() {
        let mut state = sample();
        state.content_key = "key with space".to_string();
        assert!(matches!(state.to_line(), Err(AgentError::Format(_))));

        state.content_key = "key\twith-tab".to_string();
        assert!(matches!(state.to_line(), Err(AgentError::Format(_))));
    }

    #[test]
    fn test_checksum_with_whitespace_is_rejected() {
        let mut state = sample();
        state.checksum = "ab cd".to_string();
        assert!(matches!(state.to_line(), Err(AgentError::Format(_))));
    }

    #[test]
    fn test_single_token_key_round_trips() {
        let mut state = sample();
        state.content_key = "9b2f-4c1a:v2".to_string();
        state.path = "/p".to_string();

        let parsed = FileState::parse(&state.to_line().unwrap()).unwrap();
        assert_eq!(parsed.content_key, "9b2f-4c1a:v2");
        assert_eq!(parsed.path, "/p");
    }

    #[test]
    fn test_from_file_and_is_match() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"backed up content")?;
        file.flush()?;

        let path = file.path().to_string_lossy().to_string();
        let state = FileState::from_file(&path, &Blake3Checksum)?;

        assert_eq!(state.file_size, 17);
        assert_eq!(state.checksum.len(), 64);
        assert!(state.is_match(&Blake3Checksum)?);

        file.write_all(b" and more")?;
        file.flush()?;
        assert!(!state.is_match(&Blake3Checksum)?);
        Ok(())
    }
}
