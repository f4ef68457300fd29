use rand::distributions::{Alphanumeric, DistString};

pub const DEVICE_TOKEN_LEN: usize = 48;
pub const LOCAL_API_TOKEN_LEN: usize = 32;

pub fn random_string(length: usize) -> String {
    let mut rng = rand::thread_rng();

    Alphanumeric.sample_string(&mut rng, length)
}

pub fn device_token() -> String {
    random_string(DEVICE_TOKEN_LEN)
}

pub fn local_api_token() -> String {
    random_string(LOCAL_API_TOKEN_LEN)
}
