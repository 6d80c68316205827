//! Reply deadlines for the commands whose worst case differs from the
//! configured default. Values follow the maximum response times published
//! for the EC2x/EG9x command set.

use embassy_time::Duration;

/// `AT+CSQ`, `AT+CPIN?`, `AT+CREG?`, `AT+CGREG?`, `AT+COPS?`, `AT+CCLK?`.
pub const fn status_query() -> Duration {
    Duration::from_millis(2000)
}

/// Context table query `AT+QIACT?`.
pub const fn context_query() -> Duration {
    Duration::from_millis(1000)
}

/// `AT+QIACT=<ctx>`; the network may take minutes to grant a bearer.
pub const fn context_activation() -> Duration {
    Duration::from_secs(150)
}

/// Open socket table query `AT+QISTATE`.
pub const fn socket_state_query() -> Duration {
    Duration::from_millis(1000)
}

/// Prompt (`>`) after `AT+QISEND`.
pub const fn send_prompt() -> Duration {
    Duration::from_millis(3000)
}

/// `SEND OK` after the payload of `AT+QISEND`.
pub const fn send_ack() -> Duration {
    Duration::from_millis(5000)
}

/// Raw payload announced by a `recv` notification.
pub const fn receive_payload() -> Duration {
    Duration::from_millis(5000)
}

/// `CONNECT` after a file or URL upload command.
pub const fn connect_prompt() -> Duration {
    Duration::from_millis(5000)
}

/// `AT+QGPS?` and `AT+QGPSLOC`.
pub const fn gps_query() -> Duration {
    Duration::from_millis(2000)
}
