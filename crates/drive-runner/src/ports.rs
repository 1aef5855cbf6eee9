use anyhow::Result;
use std::net::TcpListener;

/// Ask the OS for an unused TCP port, release it, and hand the number back.
/// Another process may grab the port before the simulator binds it; with a
/// single supervised simulator that window is acceptable.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_bindable_again() {
        let port = allocate_port().expect("port");
        assert_ne!(port, 0);
        let listener = TcpListener::bind(("0.0.0.0", port)).expect("port should be free");
        drop(listener);
    }
}
