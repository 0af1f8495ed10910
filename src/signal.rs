//! Windows signal mapping (spec §9 Design Notes: "only place the core has
//! OS-dependent policy. Encoded as a small lookup; not conditional
//! compilation.").

/// Translate a stop/kill signal for the current platform. On Windows,
/// containers have no `SIGINT` handler path through the engine, so it is
/// remapped to `SIGTERM`; every other platform passes the signal through
/// unchanged.
pub fn translate_stop_signal(signal: &str) -> String {
    if cfg!(windows) && signal.eq_ignore_ascii_case("SIGINT") {
        "SIGTERM".to_string()
    } else {
        signal.to_string()
    }
}
