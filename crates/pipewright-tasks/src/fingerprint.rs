//! Task fingerprints: cache keys derived from definition and inputs

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use pipewright_core::config::InputHashing;

use crate::task::{DefinitionSource, Task, TaskError};

/// Bumped whenever the hashed layout changes, so old entries stop matching
const FINGERPRINT_VERSION: &[u8] = b"pipewright-fingerprint-v1";

const CHUNK_SIZE: usize = 64 * 1024;

/// Cache key: SHA-256 over the task name, definition and inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes fingerprints, memoising definition-file hashes.
///
/// A fingerprinter lives for one run: source files are read at most once
/// per run, and edits made between runs are always observed.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    default_hashing: InputHashing,
    definitions: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl Fingerprinter {
    pub fn new(default_hashing: InputHashing) -> Self {
        Self {
            default_hashing,
            definitions: Arc::default(),
        }
    }

    /// Fingerprint a task as it is defined right now
    pub fn fingerprint(&self, task: &Task) -> Result<Fingerprint, TaskError> {
        let definition = self.definition_hash(task)?;
        let inputs = self.inputs_hash(task)?;

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_VERSION);
        hasher.update(b"\0");
        hasher.update(task.name().as_bytes());
        hasher.update(b"\0");
        hasher.update(definition.as_bytes());
        hasher.update(b"\0");
        hasher.update(inputs.as_bytes());

        let fingerprint = Fingerprint(format!("{:x}", hasher.finalize()));
        debug!(task = %task.name(), %fingerprint, "fingerprint computed");
        Ok(fingerprint)
    }

    /// Hash of the task's whole defining source unit
    pub fn definition_hash(&self, task: &Task) -> Result<String, TaskError> {
        match task.source() {
            DefinitionSource::None => Ok(String::new()),
            DefinitionSource::Inline(text) => Ok(sha256_hex(text.as_bytes())),
            DefinitionSource::File(path) => {
                let mut memo = self
                    .definitions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(hash) = memo.get(path) {
                    return Ok(hash.clone());
                }

                let hash = hash_file(path).map_err(|e| TaskError::io(task.name(), path, e))?;
                trace!(path = %path.display(), %hash, "definition hashed");
                memo.insert(path.clone(), hash.clone());
                Ok(hash)
            }
        }
    }

    /// Combined hash of every declared input; empty when none are declared
    pub fn inputs_hash(&self, task: &Task) -> Result<String, TaskError> {
        if task.inputs().is_empty() {
            return Ok(String::new());
        }

        let mode = task.input_hashing().unwrap_or(self.default_hashing);
        let mut hasher = Sha256::new();

        for path in expand_inputs(task)? {
            let file_hash = match mode {
                InputHashing::Content => hash_file(&path),
                InputHashing::Metadata => hash_metadata(&path),
            }
            .map_err(|e| TaskError::io(task.name(), &path, e))?;

            trace!(task = %task.name(), path = %path.display(), hash = %file_hash, "input hashed");
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(file_hash.as_bytes());
            hasher.update(b"\0");
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// SHA-256 of a file's contents, read in chunks
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Cheap stand-in for content hashing: size and modification time
fn hash_metadata(path: &Path) -> std::io::Result<String> {
    let meta = fs::metadata(path)?;
    let modified = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(sha256_hex(format!("{}:{}", meta.len(), modified).as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn is_pattern(path: &Path) -> bool {
    path.to_string_lossy().contains(['*', '?', '['])
}

/// Resolve declared inputs to concrete files, in declaration order.
///
/// Patterns and directories expand to their files sorted by path. Anything
/// that resolves to no file at all is an `InputNotFound`.
fn expand_inputs(task: &Task) -> Result<Vec<PathBuf>, TaskError> {
    let mut files = Vec::new();

    for declared in task.inputs() {
        let pattern = if is_pattern(declared) {
            declared.to_string_lossy().into_owned()
        } else {
            let meta = fs::metadata(declared).map_err(|e| TaskError::io(task.name(), declared, e))?;
            if !meta.is_dir() {
                files.push(declared.clone());
                continue;
            }
            declared.join("**").join("*").to_string_lossy().into_owned()
        };

        let paths = glob::glob(&pattern).map_err(|e| TaskError::InvalidPattern {
            task: task.name().to_string(),
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;

        let mut matched: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
        if matched.is_empty() {
            return Err(TaskError::InputNotFound {
                task: task.name().to_string(),
                path: declared.clone(),
            });
        }
        matched.sort();
        files.extend(matched);
    }

    Ok(files)
}
