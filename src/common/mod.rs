/**
 * common/mod.rs
 *
 * Validation utilities for IP addresses, ports, and "IP:port" socket strings
 */

/// Validate a dotted-decimal IPv4 address string.
///
/// Exactly four decimal segments of 1-3 digits, each in 0-255.
pub fn validate_ip(ip: &str) -> bool {
    let segments: Vec<&str> = ip.split('.').collect();
    if segments.len() != 4 {
        return false;
    }

    segments.iter().all(|segment| {
        if segment.is_empty() || segment.len() > 3 {
            return false;
        }
        if !segment.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        // 1-3 ASCII digits always parse
        segment.parse::<u16>().map_or(false, |num| num <= 255)
    })
}

/// Validate a port number.
pub fn validate_port(port: i64) -> bool {
    (0..=65535).contains(&port)
}

/// Validate a port number given as a string.
pub fn validate_port_str(port_str: &str) -> bool {
    port_str.parse::<i64>().map_or(false, validate_port)
}

/// Validate a socket string in the format "IP:port".
pub fn validate_socket_string(socket_str: &str) -> bool {
    match extract_ip_port(socket_str) {
        Some((ip, port)) => validate_ip(ip) && validate_port_str(port),
        None => false,
    }
}

/// Split a socket string into its IP and port parts.
///
/// Returns `None` when there is no single ':' separator or either part
/// is empty; the parts themselves are not validated here.
pub fn extract_ip_port(socket_str: &str) -> Option<(&str, &str)> {
    let (ip, port) = socket_str.split_once(':')?;
    if ip.is_empty() || port.is_empty() || port.contains(':') {
        return None;
    }
    Some((ip, port))
}
