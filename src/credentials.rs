//! Backend credentials in the OS credential store.
//!
//! On Windows this is the Credential Manager, on macOS the Keychain, and on
//! Linux the Secret Service API (all via the `keyring` crate). Onboarding
//! hands the agent a connection string, either raw JSON or base64 of
//! `{"url": .., "key": .., "aid": ..}`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::backend::normalize_backend_url;
use crate::config::BackendCredentials;

const SERVICE_NAME: &str = "courier-sync";

const KEY_BACKEND_URL: &str = "backend_url";
const KEY_AGENT_ID: &str = "agent_id";
const KEY_API_KEY: &str = "agent_api_key";

const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_AGENT_ID, KEY_API_KEY];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Read one credential. `None` when absent or the store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

pub fn load_credentials() -> Option<BackendCredentials> {
    Some(BackendCredentials {
        base_url: get_credential(KEY_BACKEND_URL)?,
        agent_id: get_credential(KEY_AGENT_ID)?,
        api_key: Zeroizing::new(get_credential(KEY_API_KEY)?),
    })
}

pub fn store_credentials(creds: &BackendCredentials) -> Result<(), String> {
    set_credential(KEY_BACKEND_URL, &normalize_backend_url(&creds.base_url))?;
    set_credential(KEY_AGENT_ID, creds.agent_id.trim())?;
    set_credential(KEY_API_KEY, creds.api_key.trim())?;
    info!(agent_id = %creds.agent_id, "agent credentials stored");
    Ok(())
}

/// Delete every stored credential (sign-out).
pub fn clear_credentials() -> Result<(), String> {
    info!("clearing agent credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

fn decode_connection_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    // Accept the URL-safe alphabet and missing padding.
    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Decode an onboarding connection string. All three fields are required.
pub fn decode_connection_string(raw: &str) -> Option<BackendCredentials> {
    let payload = decode_connection_payload(raw)?;
    Some(BackendCredentials {
        base_url: normalize_backend_url(&str_any(&payload, &["url", "backendUrl"])?),
        agent_id: str_any(&payload, &["aid", "agentId"])?,
        api_key: Zeroizing::new(str_any(&payload, &["key", "apiKey"])?),
    })
}

/// Decode a connection string and persist it in the credential store.
pub fn apply_connection_string(raw: &str) -> Result<BackendCredentials, String> {
    let creds = decode_connection_string(raw)
        .ok_or("Connection string is not valid or is missing url/key/aid")?;
    store_credentials(&creds)?;
    Ok(creds)
}
