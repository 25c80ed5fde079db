//! Canned FTP-style replies

pub const USER_OK: &str = "331 Please specify the password.";
pub const LOGIN_OK: &str = "230 Login successful.";
pub const UNKNOWN: &str = "500 Unknown command.";

/// Recognized commands, matched against the exact bytes of one read
const COMMANDS: &[(&str, &str)] = &[
    ("USER anonymous\r\n", USER_OK),
    ("PASS password\r\n", LOGIN_OK),
];

/// Pick the reply line for one chunk of input.
///
/// Strict mode requires the exact command including its CRLF. Relaxed mode
/// ignores the line terminator and letter case.
pub fn reply_for(input: &str, relaxed: bool) -> &'static str {
    let found = if relaxed {
        let input = input.trim_end_matches(['\r', '\n']);
        COMMANDS
            .iter()
            .find(|(cmd, _)| cmd.trim_end_matches(['\r', '\n']).eq_ignore_ascii_case(input))
    } else {
        COMMANDS.iter().find(|(cmd, _)| *cmd == input)
    };

    found.map(|(_, reply)| *reply).unwrap_or(UNKNOWN)
}
