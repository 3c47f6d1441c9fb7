pub mod error;
pub mod hub;
mod peer;
pub mod room;

use rand::Rng;
use rand::distr::Alphanumeric;

pub use error::HubError;
pub use hub::{Hub, HubConfig};
pub use room::{Room, RoomConfig};

/// Random URL-safe token, used for generated room ids and session ids.
pub fn generate_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
