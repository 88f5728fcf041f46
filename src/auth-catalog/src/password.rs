//! MySQL "native password" verification: `SHA1(password) XOR SHA1(scramble
//! || SHA1(SHA1(password)))`, checked without ever recovering the plaintext.

use sha1::{Digest, Sha1};

/// Length in bytes of a double-SHA1 native-password hash as stored in
/// `mysql.user.authentication_string`/`Password`.
pub const HASH_LEN: usize = 20;

/// Length of the legacy pre-4.1 `OLD_PASSWORD` hash. Rows carrying a hash of
/// this length are neither empty nor a valid double-SHA1 and are rejected by
/// the loader rather than misparsed (see `loader`).
pub const OLD_PASSWORD_HASH_LEN: usize = 16;

fn sha1(bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Verify a client's native-password response against a stored double-SHA1
/// hash and the scramble issued for this handshake.
///
/// Returns `(authenticated, sha1_of_password)`. `sha1_of_password` is
/// `SHA1(password)` recovered from the handshake without ever reconstructing
/// the plaintext — the proxy replays it to the backend as that backend's own
/// native-password response. It is all-zero whenever `authenticated` is
/// `false`, or for the passwordless edge case below where there is no real
/// password to recover.
///
/// - A passwordless account (`stored_hash` empty) accepts only an empty
///   `client_response` (an anonymous-bind attempt must still present empty
///   token, not an arbitrary one).
/// - `client_response` is `SHA1(password) XOR SHA1(scramble ||
///   SHA1(SHA1(password)))` as sent by the client; `scramble` is the 20-byte
///   nonce generated for the handshake.
pub fn check(stored_hash: &[u8], scramble: &[u8], client_response: &[u8]) -> (bool, [u8; HASH_LEN]) {
    let zero = [0u8; HASH_LEN];

    let stored: [u8; HASH_LEN] = if stored_hash.is_empty() {
        zero
    } else if stored_hash.len() == HASH_LEN {
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(stored_hash);
        buf
    } else {
        return (false, zero);
    };

    if client_response.is_empty() {
        // empty token: authenticated only for a genuinely passwordless
        // account (empty stored_hash), with no password to replay.
        return (stored == zero, zero);
    }
    if client_response.len() != HASH_LEN {
        return (false, zero);
    }

    let stage2 = sha1(&[scramble, &stored[..]].concat());
    let mut password_sha1 = [0u8; HASH_LEN];
    password_sha1.copy_from_slice(&xor(client_response, &stage2));
    let candidate = sha1(&password_sha1);
    (candidate == stored, password_sha1)
}

/// Compute the stored double-SHA1 hash for a plaintext password, as used by
/// tests and by any tooling that needs to seed a catalog without a live
/// backend.
pub fn hash_password(password: &str) -> [u8; HASH_LEN] {
    sha1(&sha1(password.as_bytes()))
}

/// `SHA1(password)` — the value `check` recovers and returns as
/// `sha1_of_password` on a successful match. Exposed for tests and tooling
/// that need to assert against it directly.
pub fn sha1_of_password(password: &str) -> [u8; HASH_LEN] {
    sha1(password.as_bytes())
}

/// Compute the client-side response a real MySQL client would send for
/// `password` given `scramble`, for use in tests that exercise `check`
/// end-to-end instead of asserting against a precomputed hash.
pub fn client_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = sha1(password.as_bytes());
    let stage2 = sha1(&stage1);
    let stage3 = sha1(&[scramble, &stage2].concat());
    xor(&stage1, &stage3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_round_trips() {
        let scramble = b"01234567890123456789";
        let stored = hash_password("hunter2");
        let response = client_response("hunter2", scramble);
        let (ok, password_sha1) = check(&stored, scramble, &response);
        assert!(ok);
        assert_eq!(password_sha1, sha1_of_password("hunter2"));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let scramble = b"01234567890123456789";
        let stored = hash_password("hunter2");
        let response = client_response("wrong-password", scramble);
        assert!(!check(&stored, scramble, &response).0);
    }

    #[test]
    fn passwordless_account_requires_empty_response() {
        let scramble = b"01234567890123456789";
        let (ok, password_sha1) = check(&[], scramble, &[]);
        assert!(ok);
        assert_eq!(password_sha1, [0u8; HASH_LEN]);
        let nonempty = client_response("anything", scramble);
        assert!(!check(&[], scramble, &nonempty).0);
    }

    /// For any scramble `S` and non-empty password `P`, given `stored =
    /// SHA1(SHA1(P))` and `token = SHA1(P) XOR SHA1(S || stored)`,
    /// `check(stored, token, S) == (true, SHA1(P))`.
    #[test]
    fn check_round_trips_for_arbitrary_password() {
        for password in ["hunter2", "correct horse battery staple", "p"] {
            let scramble = b"abcdefghijklmnopqrst";
            let stored = hash_password(password);
            let token = client_response(password, scramble);
            let (ok, password_sha1) = check(&stored, scramble, &token);
            assert!(ok);
            assert_eq!(password_sha1, sha1_of_password(password));
        }
    }

    #[test]
    fn malformed_length_response_is_rejected() {
        let scramble = b"01234567890123456789";
        let stored = hash_password("hunter2");
        assert!(!check(&stored, scramble, b"too-short").0);
    }

    #[test]
    fn different_scrambles_never_collide() {
        let stored = hash_password("hunter2");
        let response_a = client_response("hunter2", b"aaaaaaaaaaaaaaaaaaaa");
        assert!(!check(&stored, b"bbbbbbbbbbbbbbbbbbbb", &response_a).0);
    }
}
