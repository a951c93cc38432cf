use crate::common::box_error::BoxError;
use log::warn;
use simple_error::bail;

// utility functions

/// mac address of the first real interface, lower case hex without separators
pub fn get_my_mac_address() -> Result<String, BoxError> {
    match mac_address::get_mac_address()? {
        Some(mac) => Ok(mac.to_string().replace(':', "").to_lowercase()),
        None => bail!("no network interface with a mac address"),
    }
}

/// endpoint id used when the config does not name one
///
/// Derived from the mac address so a unit keeps its id across restarts.  Falls back to a
/// random id on hosts without one.
pub fn default_peer_id() -> String {
    match get_my_mac_address() {
        Ok(mac) => format!("rtjam-{}", mac),
        Err(e) => {
            warn!("utils::default_peer_id - {}, using a random id", e);
            format!("rtjam-{:08x}", rand::random::<u32>())
        }
    }
}
