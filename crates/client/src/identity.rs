use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

/// Default on-disk location for the cached identity, relative to a data root.
pub const DEFAULT_IDENTITY_FILE: &str = ".soar/identity.tsv";

pub type IdentityResult<T> = Result<T, IdentityStoreError>;

/// Locally cached identity the client presents to the assistant service.
///
/// The service treats both fields as opaque strings; `email` doubles as the
/// `userId` for conversation creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdentityStoreError {
    #[snafu(display("failed to create identity directory at {path}"))]
    CreateDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read identity file at {path}"))]
    ReadFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write identity file at {path}"))]
    WriteFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("identity file line {line_number} is malformed: {reason}"))]
    MalformedLine {
        stage: &'static str,
        line_number: usize,
        reason: &'static str,
    },
}

/// Line-based `key<TAB>value` store for the cached identity.
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the store at the default location under `data_root`.
    pub fn in_data_root(data_root: impl AsRef<Path>) -> Self {
        Self::new(data_root.as_ref().join(DEFAULT_IDENTITY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the cached identity; `None` when nothing has been saved yet.
    pub fn load(&self) -> IdentityResult<Option<StoredIdentity>> {
        let stage = "identity-load";
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(source).context(ReadFileSnafu {
                    stage,
                    path: self.path.display().to_string(),
                });
            }
        };

        let mut email = None;
        let mut display_name = None;

        for (index, line) in raw.lines().enumerate() {
            if line.is_empty() {
                continue;
            }

            let mut fields = line.splitn(2, '\t');
            let key = fields.next().unwrap_or_default();
            let value = fields.next().ok_or_else(|| {
                MalformedLineSnafu {
                    stage,
                    line_number: index + 1,
                    reason: "missing-value",
                }
                .build()
            })?;

            match key {
                "email" => email = Some(decode_field(value)),
                "display_name" => display_name = Some(decode_field(value)),
                // Unknown keys are ignored so older files keep loading.
                _ => {}
            }
        }

        match email {
            Some(email) => Ok(Some(StoredIdentity {
                email,
                display_name: display_name.unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }

    pub fn save(&self, identity: &StoredIdentity) -> IdentityResult<()> {
        let stage = "identity-save";

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
                stage,
                path: parent.display().to_string(),
            })?;
        }

        let contents = format!(
            "email\t{}\ndisplay_name\t{}\n",
            encode_field(&identity.email),
            encode_field(&identity.display_name),
        );
        std::fs::write(&self.path, contents).context(WriteFileSnafu {
            stage,
            path: self.path.display().to_string(),
        })
    }
}

fn encode_field(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for character in raw.chars() {
        match character {
            '\n' => encoded.push_str("\\n"),
            '\t' => encoded.push_str("\\t"),
            '\r' => encoded.push_str("\\r"),
            '\\' => encoded.push_str("\\\\"),
            other => encoded.push(other),
        }
    }
    encoded
}

fn decode_field(encoded: &str) -> String {
    let mut decoded = String::with_capacity(encoded.len());
    let mut characters = encoded.chars();

    while let Some(character) = characters.next() {
        if character != '\\' {
            decoded.push(character);
            continue;
        }

        match characters.next() {
            Some('n') => decoded.push('\n'),
            Some('t') => decoded.push('\t'),
            Some('r') => decoded.push('\r'),
            Some('\\') => decoded.push('\\'),
            Some(other) => {
                decoded.push('\\');
                decoded.push(other);
            }
            None => decoded.push('\\'),
        }
    }

    decoded
}
