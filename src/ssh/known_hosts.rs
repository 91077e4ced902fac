//! OpenSSH known_hosts lookup for host key verification

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SessionError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    /// Host (or this key type for it) not recorded yet
    Unknown { fingerprint: String },
    /// Recorded key differs (possible MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Default location, ~/.ssh/known_hosts
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    /// Load the store from `path`; a missing file yields an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let hosts = if path.exists() {
            Self::parse(&fs::read_to_string(&path)?)
        } else {
            debug!("known_hosts not found at {}", path.display());
            HashMap::new()
        };
        Ok(Self {
            hosts: RwLock::new(hosts),
            path,
        })
    }

    /// Parse `hostname[,alias] keytype base64key [comment]` lines
    fn parse(content: &str) -> HashMap<String, Vec<HostKeyEntry>> {
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(names), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let entry = HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            };
            // Hashed hostnames (|1|...) are not supported
            for name in names.split(',').filter(|n| !n.starts_with('|')) {
                hosts.entry(name.to_lowercase()).or_default().push(entry.clone());
            }
        }
        info!("Loaded {} known hosts", hosts.len());
        hosts
    }

    /// Lookup key: bare host on port 22, `[host]:port` otherwise
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// SHA256 fingerprint in OpenSSH format
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let key_type = key.algorithm().as_str().to_string();
        self.verify_raw(host, port, &key_type, &key.public_key_bytes())
    }

    fn verify_raw(&self, host: &str, port: u16, key_type: &str, key_bytes: &[u8]) -> HostKeyVerification {
        let actual_b64 = BASE64.encode(key_bytes);
        let fingerprint = Self::fingerprint_bytes(key_bytes);
        let hosts = self.hosts.read();

        let entries = hosts.get(&Self::make_key(host, port)).or_else(|| {
            if port == 22 {
                None
            } else {
                hosts.get(&host.to_lowercase())
            }
        });

        let Some(entry) = entries.and_then(|e| e.iter().find(|e| e.key_type == key_type)) else {
            debug!("No {} key recorded for {}:{}", key_type, host, port);
            return HostKeyVerification::Unknown { fingerprint };
        };

        if entry.key_data == actual_b64 {
            HostKeyVerification::Verified
        } else {
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|b| Self::fingerprint_bytes(&b))
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(
                "Host key changed for {}:{}: expected {}, got {}",
                host, port, expected_fingerprint, fingerprint
            );
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            }
        }
    }

    /// Record a key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SessionError> {
        let key_type = key.algorithm().as_str().to_string();
        self.add_raw(host, port, &key_type, &key.public_key_bytes())
    }

    fn add_raw(&self, host: &str, port: u16, key_type: &str, key_bytes: &[u8]) -> Result<(), SessionError> {
        let lookup_key = Self::make_key(host, port);
        let key_data = BASE64.encode(key_bytes);

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.clone(),
            });

        append_line(&self.path, &format!("{} {} {}", lookup_key, key_type, key_data))?;
        info!("Added {} host key for {} to known_hosts", key_type, lookup_key);
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}
