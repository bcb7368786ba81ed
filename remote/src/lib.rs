//! Distributed sync: the manager/worker protocol and remote worker startup
//!
//! A manager runs the differ and serves the resulting tasks over HTTP; workers poll for batches
//! of tasks, execute them with their own transfer pipeline and push statistics deltas back.
//! Workers on other hosts are started over SSH by a [`launcher::Launcher`].

use anyhow::{Context, anyhow};

pub mod deploy;
pub mod launcher;
pub mod manager;
pub mod protocol;
pub mod worker;

/// SSH destination of a worker host, `[user@]host[:port]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshSession {

    pub fn parse(addr: &str) -> anyhow::Result<Self> {
        let addr = addr.trim();
        let (user, rest) = match addr.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(anyhow!("empty user name in worker address {addr:?}")),
            None => (None, addr),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid port in worker address {addr:?}"))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(anyhow!("empty host in worker address {addr:?}"));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// Parse repeated `--worker` values, each a comma separated list of hosts.
    pub fn parse_list(values: &[String]) -> anyhow::Result<Vec<Self>> {
        values
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl std::fmt::Display for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

pub(crate) async fn setup_ssh_session(
    session: &SshSession,
) -> anyhow::Result<std::sync::Arc<openssh::Session>> {
    let host = session.host.as_str();
    let destination = match (session.user.as_deref(), session.port) {
        (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
        (None, Some(port)) => format!("ssh://{}:{}", session.host, port),
        (Some(user), None) => format!("ssh://{user}@{host}"),
        (None, None) => format!("ssh://{host}"),
    };
    tracing::debug!("Connecting to SSH destination: {}", destination);
    let session = std::sync::Arc::new(
        openssh::Session::connect(destination, openssh::KnownHosts::Accept)
            .await
            .context("Failed to establish SSH connection")?,
    );
    Ok(session)
}

/// Address of this host on the interface used for outbound traffic
pub fn get_local_ip() -> anyhow::Result<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

/// Quote `value` for use as a single POSIX shell word.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_addresses() {
        assert_eq!(
            SshSession::parse("alice@node1:2222").unwrap(),
            SshSession {
                user: Some("alice".to_string()),
                host: "node1".to_string(),
                port: Some(2222),
            }
        );
        assert_eq!(
            SshSession::parse("node2").unwrap(),
            SshSession {
                user: None,
                host: "node2".to_string(),
                port: None,
            }
        );
        assert!(SshSession::parse("@node").is_err());
        assert!(SshSession::parse("node:http").is_err());
        assert!(SshSession::parse(":22").is_err());
        assert_eq!(SshSession::parse("bob@h:22").unwrap().to_string(), "bob@h:22");
    }

    #[test]
    fn worker_lists_are_flattened() {
        let hosts = SshSession::parse_list(&["a,b@c".to_string(), " d:1 ,".to_string()]).unwrap();
        let hosts: Vec<String> = hosts.iter().map(ToString::to_string).collect();
        assert_eq!(hosts, ["a", "b@c", "d:1"]);
    }

    #[test]
    fn shell_escaping() {
        assert_eq!(shell_escape("/tmp/osync"), "'/tmp/osync'");
        assert_eq!(shell_escape("it's"), r#"'it'\''s'"#);
    }
}
