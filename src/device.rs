// device.rs - stable device identifier backed by secure storage

use keyring::Entry;

use crate::{ids, Error, Result};

const SERVICE: &str = "synapse-engine";
const DEVICE_ID_KEY: &str = "device_id";
const ACCESS_TOKEN_KEY: &str = "access_token";

/// Returns this machine's device id, generating and persisting a fresh
/// UUIDv7 into the platform secure-storage keychain the first time it is
/// called.
pub fn device_id() -> Result<String> {
    let entry = entry(DEVICE_ID_KEY)?;

    match entry.get_password() {
        Ok(id) => Ok(id),
        Err(keyring::Error::NoEntry) => {
            let id = ids::new_uuid_v7().to_string();
            entry
                .set_password(&id)
                .map_err(|e| Error::Io(format!("failed to persist device id: {e}")))?;
            tracing::info!("generated new device id {}", id);
            Ok(id)
        }
        Err(e) => Err(Error::Io(format!("failed to read device id: {e}"))),
    }
}

/// Stores the bearer access token used to authenticate sync requests.
pub fn set_access_token(token: &str) -> Result<()> {
    entry(ACCESS_TOKEN_KEY)?
        .set_password(token)
        .map_err(|e| Error::Io(format!("failed to persist access token: {e}")))
}

/// Reads the bearer access token, if one has been stored.
pub fn access_token() -> Result<Option<String>> {
    match entry(ACCESS_TOKEN_KEY)?.get_password() {
        Ok(token) => Ok(Some(token)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(Error::Io(format!("failed to read access token: {e}"))),
    }
}

fn entry(key: &str) -> Result<Entry> {
    Entry::new(SERVICE, key).map_err(|e| Error::Io(format!("failed to open keyring entry: {e}")))
}
