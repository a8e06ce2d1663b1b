//! Password processing and the two-level encryption scheme.
//!
//! A password is at most 16 characters of UTF-8. Its AES key is the
//! SHA-256 digest of the password bytes truncated to 16 bytes. Every
//! universal header carries three 16-byte validation fields:
//!
//! - field 1: SHA-256 of the level-1 key, truncated to 16 bytes
//! - field 2: the same for the level-2 key
//! - field 3: the level-1 key encrypted under the level-2 key schedule —
//!   the recovery block that lets a level-2 password unlock level-1
//!   content (and read the level-1 hint) without knowing the level-1
//!   password.

use crate::aes;
use crate::error::{MedError, Result};
use crate::types::AccessLevel;
use sha2::{Digest, Sha256};

pub const PASSWORD_BYTES: usize = 16;
pub const MAX_PASSWORD_CHARACTERS: usize = 16;
pub const VALIDATION_FIELD_BYTES: usize = 16;
pub const HINT_BYTES: usize = 256;

/// A 176-byte expanded AES-128 key schedule.
pub type ExpandedKey = [u8; aes::EXPANDED_KEY_BYTES];

/// Derive the 16-byte AES key for a password.
pub fn expand_password(password: &str) -> Result<[u8; PASSWORD_BYTES]> {
    if password.chars().count() > MAX_PASSWORD_CHARACTERS {
        return Err(MedError::parameter(format!(
            "password exceeds {MAX_PASSWORD_CHARACTERS} characters"
        )));
    }
    let digest = Sha256::digest(password.as_bytes());
    let mut key = [0u8; PASSWORD_BYTES];
    key.copy_from_slice(&digest[..PASSWORD_BYTES]);
    Ok(key)
}

fn validation_field(key: &[u8; PASSWORD_BYTES]) -> [u8; VALIDATION_FIELD_BYTES] {
    let digest = Sha256::digest(key);
    let mut field = [0u8; VALIDATION_FIELD_BYTES];
    field.copy_from_slice(&digest[..VALIDATION_FIELD_BYTES]);
    field
}

/// Processed password state carried by a context: the expanded key
/// schedules for both levels (as far as the supplied password unlocks
/// them), the hints, and the effective access level.
#[derive(Clone)]
pub struct PasswordData {
    level_1_key: Option<ExpandedKey>,
    level_2_key: Option<ExpandedKey>,
    pub level_1_hint: Option<String>,
    pub level_2_hint: Option<String>,
    pub access_level: AccessLevel,
    pub processed: bool,
}

impl std::fmt::Debug for PasswordData {
    // Key schedules stay out of debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordData")
            .field("access_level", &self.access_level)
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}

impl Default for PasswordData {
    fn default() -> Self {
        PasswordData {
            level_1_key: None,
            level_2_key: None,
            level_1_hint: None,
            level_2_hint: None,
            access_level: AccessLevel::None,
            processed: false,
        }
    }
}

impl PasswordData {
    /// Match a password against the three validation fields of a
    /// universal header. A level-1 match grants level-1 access; a
    /// level-2 match grants level-2 access and recovers the level-1 key
    /// from the encrypted recovery block.
    pub fn process(
        password: &str,
        validation_fields: &[[u8; VALIDATION_FIELD_BYTES]; 3],
    ) -> Result<Self> {
        let key = expand_password(password)?;
        let field = validation_field(&key);

        if field == validation_fields[0] {
            return Ok(PasswordData {
                level_1_key: Some(aes::expand_key(&key)),
                level_2_key: None,
                level_1_hint: None,
                level_2_hint: None,
                access_level: AccessLevel::Level1,
                processed: true,
            });
        }

        if field == validation_fields[1] {
            let level_2 = aes::expand_key(&key);
            let mut recovered = validation_fields[2];
            aes::decrypt_block(&mut recovered, &level_2);
            return Ok(PasswordData {
                level_1_key: Some(aes::expand_key(&recovered)),
                level_2_key: Some(level_2),
                level_1_hint: None,
                level_2_hint: None,
                access_level: AccessLevel::Level2,
                processed: true,
            });
        }

        Err(MedError::BadPassword { hint: None })
    }

    /// The key schedule for content encrypted at `level`, when this
    /// password grants it.
    pub fn key_for_level(&self, level: i8) -> Option<&ExpandedKey> {
        match level {
            1 => self.level_1_key.as_ref(),
            2 => self.level_2_key.as_ref(),
            _ => None,
        }
    }
}

/// Build the three universal-header validation fields for a new session
/// from its two passwords.
pub fn build_validation_fields(
    level_1_password: &str,
    level_2_password: &str,
) -> Result<[[u8; VALIDATION_FIELD_BYTES]; 3]> {
    let l1 = expand_password(level_1_password)?;
    let l2 = expand_password(level_2_password)?;
    let mut recovery = l1;
    aes::encrypt_block(&mut recovery, &aes::expand_key(&l2));
    Ok([validation_field(&l1), validation_field(&l2), recovery])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_1_password_grants_level_1() {
        let fields = build_validation_fields("patient", "research").unwrap();
        let data = PasswordData::process("patient", &fields).unwrap();
        assert_eq!(data.access_level, AccessLevel::Level1);
        assert!(data.key_for_level(1).is_some());
        assert!(data.key_for_level(2).is_none());
    }

    #[test]
    fn level_2_password_recovers_level_1_key() {
        let fields = build_validation_fields("patient", "research").unwrap();
        let l2 = PasswordData::process("research", &fields).unwrap();
        assert_eq!(l2.access_level, AccessLevel::Level2);

        // The recovered level-1 schedule equals the directly derived one.
        let l1 = PasswordData::process("patient", &fields).unwrap();
        assert_eq!(
            l2.key_for_level(1).unwrap().as_slice(),
            l1.key_for_level(1).unwrap().as_slice()
        );
    }

    #[test]
    fn wrong_password_is_rejected() {
        let fields = build_validation_fields("patient", "research").unwrap();
        let err = PasswordData::process("intruder", &fields).unwrap_err();
        assert!(matches!(err, MedError::BadPassword { .. }));
    }

    #[test]
    fn over_long_password_is_rejected() {
        assert!(expand_password("seventeen chars!!").is_err());
        assert!(expand_password("sixteen chars ok").is_ok());
    }

    #[test]
    fn multibyte_passwords_count_characters_not_bytes() {
        // 16 two-byte characters are a legal password.
        let pw = "µµµµµµµµµµµµµµµµ";
        assert_eq!(pw.chars().count(), 16);
        assert!(expand_password(pw).is_ok());
    }
}
