use time::OffsetDateTime;

use crate::resources::Time;

// Alphabet used by the api server when generating names, vowels and easily confused characters
// removed.
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const RANDOM_SUFFIX_LENGTH: usize = 5;
const MAX_NAME_LENGTH: usize = 63;
const MAX_GENERATED_PREFIX_LENGTH: usize = MAX_NAME_LENGTH - RANDOM_SUFFIX_LENGTH;

pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now() -> Time {
    Time(OffsetDateTime::now_utc())
}

/// Append a random suffix to `prefix`, truncating the prefix so the result is a valid object name.
pub fn generate_name(prefix: &str) -> String {
    let mut name: String = prefix.chars().take(MAX_GENERATED_PREFIX_LENGTH).collect();
    let entropy = uuid::Uuid::new_v4();
    for byte in entropy.as_bytes().iter().take(RANDOM_SUFFIX_LENGTH) {
        name.push(NAME_ALPHABET[*byte as usize % NAME_ALPHABET.len()] as char);
    }
    name
}
