//! Salted password hashing.

use rand::Rng;
use sha2::{Digest, Sha512};

const SALT_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SALT_LEN: usize = 16;

/// Generates a random alphanumeric salt.
pub fn generate_salt() -> String {
    let mut rng = rand::thread_rng();
    (0..SALT_LEN)
        .map(|_| SALT_ALPHABET[rng.gen_range(0..SALT_ALPHABET.len())] as char)
        .collect()
}

/// Hashes `password` with `salt`; returns a lowercase hex digest.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_has_expected_shape() {
        let salt = generate_salt();
        assert_eq!(salt.len(), SALT_LEN);
        assert!(salt.bytes().all(|b| SALT_ALPHABET.contains(&b)));
    }

    #[test]
    fn salts_are_unique() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(
            hash_password("secret", "salt1234salt1234"),
            hash_password("secret", "salt1234salt1234")
        );
    }

    #[test]
    fn salt_changes_the_hash() {
        assert_ne!(
            hash_password("secret", "aaaaaaaaaaaaaaaa"),
            hash_password("secret", "bbbbbbbbbbbbbbbb")
        );
    }

    #[test]
    fn password_changes_the_hash() {
        assert_ne!(
            hash_password("secret", "aaaaaaaaaaaaaaaa"),
            hash_password("Secret", "aaaaaaaaaaaaaaaa")
        );
    }
}
