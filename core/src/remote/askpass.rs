//! OpenSSH askpass hook for password authentication.
//!
//! ssh never reads a password from an argument. With `SSH_ASKPASS_REQUIRE=force`
//! it runs the program named by `SSH_ASKPASS` and reads the password from that
//! program's stdout. The hpcserve binaries act as their own askpass program:
//! when started with `HPCSERVE_ASKPASS=1` they print the secret handed down in
//! the environment and exit.

use std::io::Write;
use std::path::Path;

use tokio::process::Command;

pub const ASKPASS_ENV: &str = "HPCSERVE_ASKPASS";
pub const SECRET_ENV: &str = "HPCSERVE_ASKPASS_SECRET";

/// Configure `command` (an ssh invocation) to authenticate with `password`.
pub fn apply(command: &mut Command, askpass_program: &Path, password: &str) {
    command
        .env("SSH_ASKPASS", askpass_program)
        .env("SSH_ASKPASS_REQUIRE", "force")
        .env(ASKPASS_ENV, "1")
        .env(SECRET_ENV, password);
    // Older OpenSSH only consults SSH_ASKPASS when DISPLAY is set.
    if std::env::var_os("DISPLAY").is_none() {
        command.env("DISPLAY", ":0");
    }
}

/// The secret to answer with, if this process was started as askpass.
pub fn secret_from_env() -> Option<String> {
    match std::env::var(ASKPASS_ENV) {
        Ok(flag) if flag == "1" => std::env::var(SECRET_ENV).ok(),
        _ => None,
    }
}

/// Entry hook for binaries. Returns true when the process was started as
/// askpass and has already answered; the caller should exit immediately.
pub fn run_if_invoked() -> bool {
    match secret_from_env() {
        Some(secret) => {
            let mut out = std::io::stdout();
            let _ = writeln!(out, "{}", secret);
            let _ = out.flush();
            true
        }
        None => false,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_sets_askpass_environment() {
        let mut cmd = Command::new("ssh");
        apply(&mut cmd, Path::new("/usr/local/bin/hpcserve"), "pw");
        let envs: Vec<(String, String)> = cmd
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| {
                Some((k.to_string_lossy().to_string(), v?.to_string_lossy().to_string()))
            })
            .collect();
        assert!(envs.contains(&("SSH_ASKPASS".into(), "/usr/local/bin/hpcserve".into())));
        assert!(envs.contains(&("SSH_ASKPASS_REQUIRE".into(), "force".into())));
        assert!(envs.contains(&(ASKPASS_ENV.into(), "1".into())));
        assert!(envs.contains(&(SECRET_ENV.into(), "pw".into())));
    }
}
