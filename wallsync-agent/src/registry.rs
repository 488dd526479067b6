//! Minimal `HKEY_CURRENT_USER` string-value access.

use std::string::FromUtf16Error;

use thiserror::Error;
use windows_sys::Win32::Foundation::ERROR_FILE_NOT_FOUND;
use windows_sys::Win32::System::Registry::{
    HKEY, HKEY_CURRENT_USER, KEY_QUERY_VALUE, KEY_READ, KEY_SET_VALUE, KEY_WRITE, REG_SZ,
    RegCloseKey, RegDeleteValueW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("RegOpenKeyExW({subkey}) failed: {status}")]
    Open { subkey: String, status: u32 },
    #[error("RegQueryValueExW({name}) failed: {status}")]
    Query { name: String, status: u32 },
    #[error("RegSetValueExW({name}) failed: {status}")]
    Set { name: String, status: u32 },
    #[error("RegDeleteValueW({name}) failed: {status}")]
    Delete { name: String, status: u32 },
    #[error("registry value too large")]
    ValueTooLarge,
    #[error("invalid UTF-16 in registry value: {0}")]
    InvalidUtf16(#[source] FromUtf16Error),
}

/// Open key that is closed on drop.
struct Key(HKEY);

impl Key {
    fn open(subkey: &str, desired_access: u32) -> Result<Self, RegistryError> {
        let subkey_w = wide_null(subkey);
        let mut out: HKEY = 0;
        // SAFETY: `subkey_w` is NUL-terminated and `out` is a valid out-pointer.
        let status = unsafe {
            RegOpenKeyExW(
                HKEY_CURRENT_USER,
                subkey_w.as_ptr(),
                0,
                desired_access,
                &mut out,
            )
        };
        if status != 0 {
            return Err(RegistryError::Open {
                subkey: subkey.to_owned(),
                status,
            });
        }
        Ok(Self(out))
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        // SAFETY: the key was opened by RegOpenKeyExW and is closed exactly once.
        unsafe { RegCloseKey(self.0) };
    }
}

pub fn get_string(subkey: &str, name: &str) -> Result<Option<String>, RegistryError> {
    let key = Key::open(subkey, KEY_READ | KEY_QUERY_VALUE)?;
    let name_w = wide_null(name);

    let mut value_type: u32 = 0;
    let mut size_bytes: u32 = 0;
    // SAFETY: size query with a null data pointer.
    let status = unsafe {
        RegQueryValueExW(
            key.0,
            name_w.as_ptr(),
            std::ptr::null_mut(),
            &mut value_type,
            std::ptr::null_mut(),
            &mut size_bytes,
        )
    };
    if status == ERROR_FILE_NOT_FOUND {
        return Ok(None);
    }
    if status != 0 {
        return Err(RegistryError::Query {
            name: name.to_owned(),
            status,
        });
    }
    if value_type != REG_SZ {
        return Ok(None);
    }
    if size_bytes == 0 {
        return Ok(Some(String::new()));
    }

    let mut buf: Vec<u8> = vec![0u8; size_bytes as usize];
    let mut read_bytes = size_bytes;
    // SAFETY: `buf` holds `read_bytes` writable bytes.
    let status = unsafe {
        RegQueryValueExW(
            key.0,
            name_w.as_ptr(),
            std::ptr::null_mut(),
            &mut value_type,
            buf.as_mut_ptr(),
            &mut read_bytes,
        )
    };
    if status != 0 {
        return Err(RegistryError::Query {
            name: name.to_owned(),
            status,
        });
    }
    buf.truncate(read_bytes as usize);

    let mut utf16: Vec<u16> = buf
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    while utf16.last() == Some(&0) {
        utf16.pop();
    }
    String::from_utf16(&utf16)
        .map(Some)
        .map_err(RegistryError::InvalidUtf16)
}

pub fn set_string(subkey: &str, name: &str, value: &str) -> Result<(), RegistryError> {
    let key = Key::open(subkey, KEY_WRITE | KEY_SET_VALUE)?;
    let name_w = wide_null(name);
    let bytes: Vec<u8> = wide_null(value)
        .into_iter()
        .flat_map(u16::to_le_bytes)
        .collect();
    let len = u32::try_from(bytes.len()).map_err(|_| RegistryError::ValueTooLarge)?;

    // SAFETY: `bytes` is a NUL-terminated UTF-16LE buffer of `len` bytes.
    let status = unsafe { RegSetValueExW(key.0, name_w.as_ptr(), 0, REG_SZ, bytes.as_ptr(), len) };
    if status != 0 {
        return Err(RegistryError::Set {
            name: name.to_owned(),
            status,
        });
    }
    Ok(())
}

pub fn delete_value(subkey: &str, name: &str) -> Result<(), RegistryError> {
    let key = Key::open(subkey, KEY_WRITE | KEY_SET_VALUE)?;
    let name_w = wide_null(name);
    // SAFETY: `name_w` is NUL-terminated.
    let status = unsafe { RegDeleteValueW(key.0, name_w.as_ptr()) };
    if status == 0 || status == ERROR_FILE_NOT_FOUND {
        return Ok(());
    }
    Err(RegistryError::Delete {
        name: name.to_owned(),
        status,
    })
}

pub fn wide_null(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
