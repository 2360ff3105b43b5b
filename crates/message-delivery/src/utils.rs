use base64::Engine;
use rand::{Rng, RngCore};

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Base64 of between 1 and `max` random bytes. Empty when `max` is 0.
pub fn random_padding(max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let mut rng = rand::thread_rng();
    let mut bytes = vec![0u8; rng.gen_range(1..=max)];
    rng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
