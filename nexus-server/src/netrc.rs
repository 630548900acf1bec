//! One-shot `.netrc` lookup, used to resolve an API key when a client's
//! `InformInit` settings don't carry one directly.

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum NetrcError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Finds the `password` entry for `machine` in `$NETRC`, falling back to
/// `~/.netrc`. Returns `Ok(None)` when no netrc file exists at all.
pub fn lookup_password(machine: &str) -> Result<Option<String>, NetrcError> {
    let Some(path) = netrc_path() else { return Ok(None) };
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| NetrcError::Read { path, source })?;
    Ok(parse(&contents, machine))
}

fn netrc_path() -> Option<Utf8PathBuf> {
    if let Ok(path) = std::env::var("NETRC") {
        return Some(Utf8PathBuf::from(path));
    }
    let home = std::env::var("HOME").ok()?;
    Some(Utf8PathBuf::from(home).join(".netrc"))
}

/// Minimal tokenizer: walks whitespace-separated `key value` pairs and
/// tracks the `machine` block currently in scope.
fn parse(contents: &str, machine: &str) -> Option<String> {
    let mut tokens = contents.split_whitespace();
    let mut current_machine: Option<&str> = None;
    let mut found_password = None;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => current_machine = tokens.next(),
            "password" => {
                let value = tokens.next();
                if current_machine == Some(machine) {
                    found_password = value.map(str::to_owned);
                }
            }
            "login" | "account" => {
                tokens.next();
            }
            _ => {}
        }
    }

    found_password
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_password_for_matching_machine() {
        let contents = "machine api.wandb.ai\n  login user\n  password secret123\nmachine other.example\n  password nope\n";
        assert_eq!(parse(contents, "api.wandb.ai"), Some("secret123".to_owned()));
    }

    #[test]
    fn returns_none_for_unknown_machine() {
        let contents = "machine api.wandb.ai\n  password secret123\n";
        assert_eq!(parse(contents, "other.example"), None);
    }
}
