//! Command line interface of the blobstore
//!
//! Commands map one-to-one onto [`BlobstoreClient`] operations.  `exists`
//! reports an absent blob through exit status 3 rather than 1, so callers can
//! tell "absent" from "could not find out".
use std::{io::Write, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use tokio::fs::File;

use crate::{
    backend::StorageBackend,
    blobstore::{BlobstoreClient, ExistenceState},
    error::Result,
};

/// Exit status of `exists` when the blob is absent
pub const EXIT_NOT_FOUND: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "azure-storage-cli", version)]
#[command(about = "Blobstore client for Azure Blob Storage", long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Upload a local file
    Put { source: PathBuf, dest: String },
    /// Download a blob into a local file
    Get { source: String, dest: PathBuf },
    /// Delete a blob; deleting an absent blob succeeds
    Delete { key: String },
    /// Delete every blob under a prefix
    DeleteRecursive {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Exit 0 if the blob exists, 3 if it does not
    Exists { key: String },
    /// Print a signed URL for `get` or `put`, e.g. `sign blob get 1h`
    Sign {
        key: String,
        action: String,
        #[arg(value_parser = parse_duration)]
        expiration: Duration,
    },
    /// Print the names of all blobs under a prefix, one per line
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Copy a blob within the container
    Copy { source: String, dest: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::DeleteRecursive { .. } => "delete-recursive",
            Command::Exists { .. } => "exists",
            Command::Sign { .. } => "sign",
            Command::List { .. } => "list",
            Command::Copy { .. } => "copy",
        }
    }
}

/// How a successful command should end the process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NotFound,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::NotFound => EXIT_NOT_FOUND,
        }
    }
}

/// Runs a single command, writing any output for the user to `out`
pub async fn execute<B, W>(client: &BlobstoreClient<B>, command: Command, out: &mut W) -> Result<Outcome>
where
    B: StorageBackend,
    W: Write,
{
    match command {
        Command::Put { source, dest } => client.put(&source, &dest).await?,
        Command::Get { source, dest } => {
            let mut file = File::create(&dest).await?;
            client.get(&source, &mut file).await?;
        }
        Command::Delete { key } => client.delete(&key).await?,
        Command::DeleteRecursive { prefix } => client.delete_recursive(&prefix).await?,
        Command::Exists { key } => {
            return match client.exists(&key).await {
                ExistenceState::Exists => Ok(Outcome::Success),
                ExistenceState::DoesNotExist => Ok(Outcome::NotFound),
                ExistenceState::Unknown(err) => Err(err),
            };
        }
        Command::Sign {
            key,
            action,
            expiration,
        } => {
            let url = client.sign(&key, &action, expiration).await?;
            write!(out, "{url}")?;
        }
        Command::List { prefix } => {
            for name in client.list(&prefix).await? {
                writeln!(out, "{name}")?;
            }
        }
        Command::Copy { source, dest } => client.copy(&source, &dest).await?,
    }
    out.flush()?;
    Ok(Outcome::Success)
}

/// Parses durations such as `90s`, `1.5h` or `1h30m`
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.  Every number needs
/// a unit.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let invalid = || {
        format!("Expiration should be in the format of a duration i.e. 1h, 60m, 3600s. Got: {input}")
    };
    if input.is_empty() {
        return Err(invalid());
    }

    let mut rest = input;
    let mut total = 0_f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += number * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total.round() as u64))
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_true;

    use super::*;
    use crate::{
        error::BlobstoreError,
        memory::{MemoryBackend, Operation},
    };

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_bad_durations() {
        for input in ["", "60", "s", "1d", "1h30", "abc", "1..5s", "-1s"] {
            assert!(parse_duration(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn parses_sign_command() {
        let cli = Cli::try_parse_from([
            "azure-storage-cli",
            "-c",
            "config.json",
            "sign",
            "blob",
            "put",
            "2h",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert_eq!(
            cli.command,
            Command::Sign {
                key: "blob".to_string(),
                action: "put".to_string(),
                expiration: Duration::from_secs(7200),
            }
        );
    }

    #[test]
    fn list_prefix_is_optional() {
        let cli = Cli::try_parse_from(["azure-storage-cli", "-c", "c.json", "list"]).unwrap();
        assert_eq!(
            cli.command,
            Command::List {
                prefix: String::new()
            }
        );
    }

    #[test]
    fn rejects_wrong_argument_count() {
        assert!(Cli::try_parse_from(["azure-storage-cli", "-c", "c.json", "put", "only-one"]).is_err());
        assert!(Cli::try_parse_from(["azure-storage-cli", "-c", "c.json", "sign", "blob", "get", "soon"]).is_err());
    }

    #[tokio::test]
    async fn exists_maps_to_outcome() {
        let backend = MemoryBackend::new();
        backend.insert("present", "x");
        let client = BlobstoreClient::new(backend);
        let mut out = Vec::new();

        let present = execute(&client, Command::Exists { key: "present".to_string() }, &mut out)
            .await
            .unwrap();
        let absent = execute(&client, Command::Exists { key: "absent".to_string() }, &mut out)
            .await
            .unwrap();

        assert_eq!(present.exit_code(), 0);
        assert_eq!(absent.exit_code(), EXIT_NOT_FOUND);
    }

    #[tokio::test]
    async fn indeterminate_existence_is_an_error() {
        let backend = MemoryBackend::new().fail_on(Operation::GetProperties, None, |_| {
            BlobstoreError::UnknownError(500, "Internal Server Error".to_string())
        });
        let client = BlobstoreClient::new(backend);
        let mut out = Vec::new();

        let result = execute(&client, Command::Exists { key: "blob".to_string() }, &mut out).await;

        assert!(matches!(result, Err(BlobstoreError::UnknownError(500, _))));
    }

    #[tokio::test]
    async fn sign_prints_url_without_newline() {
        let client = BlobstoreClient::new(MemoryBackend::new());
        let mut out = Vec::new();

        execute(
            &client,
            Command::Sign {
                key: "blob".to_string(),
                action: "get".to_string(),
                expiration: Duration::from_secs(60),
            },
            &mut out,
        )
        .await
        .unwrap();

        let printed = String::from_utf8(out).unwrap();
        assert_true!(printed.starts_with("memory://memory/blob?"));
        assert_true!(!printed.ends_with('\n'));
    }

    #[tokio::test]
    async fn list_prints_one_name_per_line() {
        let backend = MemoryBackend::new();
        backend.insert("a/1", "x");
        backend.insert("a/2", "x");
        backend.insert("b/1", "x");
        let client = BlobstoreClient::new(backend);
        let mut out = Vec::new();

        execute(&client, Command::List { prefix: "a/".to_string() }, &mut out)
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "a/1\na/2\n");
    }

    #[tokio::test]
    async fn get_writes_destination_file() {
        let backend = MemoryBackend::new();
        backend.insert("blob", "hello");
        let client = BlobstoreClient::new(backend);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let mut out = Vec::new();

        execute(
            &client,
            Command::Get {
                source: "blob".to_string(),
                dest: dest.clone(),
            },
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(dest).unwrap(), b"hello");
    }
}
