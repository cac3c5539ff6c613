use ring::rand::{SecureRandom, SystemRandom};

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SEGMENTS: usize = 3;
const SEGMENT_LEN: usize = 4;

#[derive(thiserror::Error, Debug)]
#[error("Random number generator failure")]
pub struct KeyGenerationError;

/// Generates a key of the form `HK-XXXX-XXXX-XXXX`.
pub fn generate_license_key() -> Result<String, KeyGenerationError> {
    let rng = SystemRandom::new();
    let mut key = String::from("HK");

    for _ in 0..SEGMENTS {
        key.push('-');
        for _ in 0..SEGMENT_LEN {
            key.push(random_symbol(&rng)?);
        }
    }

    Ok(key)
}

// Rejection sampling keeps every symbol equally likely.
fn random_symbol(rng: &SystemRandom) -> Result<char, KeyGenerationError> {
    let limit = u8::MAX - (u8::MAX % ALPHABET.len() as u8);
    loop {
        let mut byte = [0u8; 1];
        rng.fill(&mut byte).map_err(|_| KeyGenerationError)?;
        if byte[0] < limit {
            return Ok(ALPHABET[(byte[0] as usize) % ALPHABET.len()] as char);
        }
    }
}

/// True only for the exact `HK-[A-Z0-9]{4}-[A-Z0-9]{4}-[A-Z0-9]{4}` shape.
pub fn validate_license_key_format(key: &str) -> bool {
    let mut parts = key.split('-');

    if parts.next() != Some("HK") {
        return false;
    }

    let mut segments = 0;
    for part in parts {
        segments += 1;
        let ok = part.len() == SEGMENT_LEN
            && part
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if !ok {
            return false;
        }
    }

    segments == SEGMENTS
}
