//! MySQL native-password authentication.
//!
//! The classic challenge response:
//! ```text
//! SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
//! ```

use sha1::{Digest, Sha1};

/// Compute the 20-byte native-password response to the server's salt.
///
/// An empty password produces an empty response; the login packet then
/// carries no challenge response at all.
pub fn native_password(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // The scramble is the first 20 salt bytes.
    let seed = if salt.len() > 20 { &salt[..20] } else { salt };

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_password() {
        assert!(native_password("", &[0; 20]).is_empty());
    }

    #[test]
    fn test_response_is_twenty_bytes_and_deterministic() {
        let salt = [0x3Du8; 20];
        let first = native_password("secret", &salt);
        let second = native_password("secret", &salt);
        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
    }

    #[test]
    fn test_response_depends_on_password_and_salt() {
        let salt_a = [1u8; 20];
        let salt_b = [2u8; 20];
        assert_ne!(
            native_password("secret", &salt_a),
            native_password("other", &salt_a)
        );
        assert_ne!(
            native_password("secret", &salt_a),
            native_password("secret", &salt_b)
        );
    }

    #[test]
    fn test_extra_salt_bytes_are_ignored() {
        let mut salt = vec![9u8; 20];
        let short = native_password("pw", &salt);
        salt.push(0);
        let long = native_password("pw", &salt);
        assert_eq!(short, long);
    }

    #[test]
    fn test_xor_structure_round_trips() {
        // XORing the response with SHA1(salt + SHA1(SHA1(password))) must
        // recover SHA1(password).
        let salt = [5u8; 20];
        let response = native_password("pw", &salt);

        let mut hasher = Sha1::new();
        hasher.update(b"pw");
        let stage1: [u8; 20] = hasher.finalize().into();
        let mut hasher = Sha1::new();
        hasher.update(stage1);
        let stage2: [u8; 20] = hasher.finalize().into();
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(stage2);
        let stage3: [u8; 20] = hasher.finalize().into();

        let recovered: Vec<u8> = response
            .iter()
            .zip(stage3.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(recovered, stage1.to_vec());
    }
}
