//! Marker protocol for running commands over an echoing serial shell.
//!
//! The guest is a real interactive shell, so everything typed is echoed
//! back and interleaved with prompts. Each command is wrapped as
//!
//! ```text
//! echo __BEGIN__<nonce>
//! <command>; echo __END__<nonce>:$?
//! ```
//!
//! Parsing is split in two stages that work on the accumulated buffer:
//! [`find_completion`] scans for the end marker and exit code, and
//! [`extract_output`] cuts out the command's own output and strips echo
//! artifacts.
//!
//! The echoed input line also contains `__END__<nonce>:`, but followed by
//! `$?` rather than digits, which is what tells the two apart. A command
//! that itself prints `__END__<nonce>:<digits>` before finishing would be
//! misdetected; the nonce is fresh per command, so this needs deliberate
//! forgery.

pub const BEGIN_PREFIX: &str = "__BEGIN__";
pub const END_PREFIX: &str = "__END__";

/// Bytes written to the guest to run `command` under `nonce`.
#[must_use]
pub fn command_payload(nonce: &str, command: &str) -> String {
    format!("echo {BEGIN_PREFIX}{nonce}\n{command}; echo {END_PREFIX}{nonce}:$?\n")
}

/// Command that sets the shell prompt to `<token>> `.
#[must_use]
pub fn prompt_payload(token: &str) -> String {
    format!("export PS1=\"{token}> \"\n")
}

/// Where a finished command's end marker sits in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Exit status parsed from the marker.
    pub exit_code: i32,
    /// Byte offset of `__END__` in the buffer.
    pub marker_start: usize,
}

/// Scan stage: find `__END__<nonce>:<digits>` followed by a non-digit.
///
/// The trailing non-digit guarantees the exit code was not cut short by a
/// read boundary. Returns `None` until a complete marker is present.
#[must_use]
pub fn find_completion(buffer: &str, nonce: &str) -> Option<Completion> {
    let marker = format!("{END_PREFIX}{nonce}:");
    for (start, _) in buffer.match_indices(&marker) {
        let rest = &buffer[start + marker.len()..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || digits == rest.len() {
            continue;
        }
        // Exit statuses are 0..=255; anything unparseable is not ours.
        if let Ok(exit_code) = rest[..digits].parse::<i32>() {
            return Some(Completion {
                exit_code,
                marker_start: start,
            });
        }
    }
    None
}

/// Strip stage: the command's output, between the begin marker line and the
/// end marker.
///
/// Takes the last `__BEGIN__<nonce>` before the end marker (the shell's
/// output, not the echoed `echo` line), drops the remainder of that line,
/// removes echoed input and prompt lines, and normalises `\r\n` to `\n`.
#[must_use]
pub fn extract_output(buffer: &str, nonce: &str, completion: Completion, prompt_token: &str) -> String {
    let region = &buffer[..completion.marker_start];
    let begin = format!("{BEGIN_PREFIX}{nonce}");

    let body = match region.rfind(&begin) {
        Some(pos) => {
            let after = &region[pos + begin.len()..];
            after.find('\n').map_or("", |nl| &after[nl + 1..])
        }
        None => region,
    };

    let echoed_end = format!("{END_PREFIX}{nonce}:$?");
    let prompt = format!("{prompt_token}>");

    body.replace("\r\n", "\n")
        .split_inclusive('\n')
        .filter(|line| !line.contains(&echoed_end) && !line.contains(&prompt))
        .collect()
}

/// True when the buffer ends at a login or password prompt.
#[must_use]
pub fn is_login_prompt(buffer: &str) -> bool {
    let tail = last_line(buffer).to_ascii_lowercase();
    tail.ends_with("login:") || tail.ends_with("password:")
}

/// True when the buffer ends at the runner's own prompt `<token>> `.
///
/// The echoed `export PS1="<token>> "` line ends in a quote, so it never
/// matches.
#[must_use]
pub fn ends_with_prompt_token(buffer: &str, token: &str) -> bool {
    buffer.trim_end().ends_with(&format!("{token}>"))
}

/// Heuristic for a generic shell prompt: the last line ends in `#` or `$`.
#[must_use]
pub fn looks_like_shell_prompt(buffer: &str) -> bool {
    let tail = last_line(buffer);
    tail.ends_with('#') || tail.ends_with('$')
}

/// Last non-empty line, trailing whitespace removed.
fn last_line(buffer: &str) -> &str {
    let trimmed = buffer.trim_end();
    trimmed.rsplit(['\n', '\r']).next().unwrap_or(trimmed)
}
