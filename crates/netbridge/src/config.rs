//! CLI surface for the network bridge dispatcher front end (SPEC_FULL §6).
//!
//! Grounded on `falco`'s `Args` derive shape and `daemon-bin`'s subcommand
//! layout, generalized to this crate's four connection modes plus the
//! outbound client form and the `keystore` subcommand.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "netbridge")]
#[command(about = "Network bridge dispatcher for forwarding a local producer across an authenticated remote session")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Forward a local connpoint to a remote host:port.
    #[arg(short = 's', num_args = 3, value_names = ["CONNPOINT", "HOST", "PORT"])]
    pub forward_local: Option<Vec<String>>,

    /// Forward using an inherited socket descriptor to a remote host:port.
    #[arg(short = 'S', num_args = 3, value_names = ["FD", "HOST", "PORT"])]
    pub forward_inherited: Option<Vec<String>>,

    /// Listen for inbound remote connections on this port.
    #[arg(short = 'l')]
    pub listen_port: Option<u16>,

    /// Bind host for `-l` (defaults to all interfaces).
    #[arg(long = "listen-host", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Exec a binary (and arguments) for each accepted connection instead
    /// of forwarding to a local producer. Spelled `--exec` here (clap's
    /// long-flag convention) rather than the single-dash `-exec` form.
    #[arg(long = "exec", num_args = 1.., allow_hyphen_values = true)]
    pub exec: Option<Vec<String>>,

    /// Single-connection mode: handle one connection and exit (no fork).
    #[arg(short = 't')]
    pub single: bool,

    /// Disable redirecting to `ARCAN_CONNPATH` on remote exit.
    #[arg(short = 'X')]
    pub no_redirect: bool,

    /// Bounded outbound retry count.
    #[arg(short = 'r', long = "retry")]
    pub retry: Option<u32>,

    /// Trace-group selector: a bitmap or a CSV of group names.
    #[arg(short = 'd')]
    pub trace_groups: Option<String>,

    /// Read an authentication secret from stdin; an optional count
    /// pre-authorises that many public keys.
    #[arg(short = 'a', num_args = 0..=1, default_missing_value = "0")]
    pub auth_stdin: Option<u32>,

    /// Ambient logging severity, independent of `-d`.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Outbound client positional form: `[tag@]host [port]`.
    #[arg(value_name = "TARGET")]
    pub target: Option<String>,

    #[arg(value_name = "PORT")]
    pub target_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a keystore entry: `keystore [-b dir] tag host [port]`.
    Keystore {
        /// Keystore root directory override.
        #[arg(short = 'b')]
        base_dir: Option<std::path::PathBuf>,
        tag: String,
        host: String,
        #[arg(default_value_t = host_config::DEFAULT_PORT)]
        port: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_mode_with_exec() {
        let args = Args::parse_from(["netbridge", "-l", "6680", "--exec", "cat"]);
        assert_eq!(args.listen_port, Some(6680));
        assert_eq!(args.exec, Some(vec!["cat".to_string()]));
    }

    #[test]
    fn parses_forward_local_mode() {
        let args = Args::parse_from(["netbridge", "-s", "demo", "example.com", "6680"]);
        assert_eq!(
            args.forward_local,
            Some(vec!["demo".into(), "example.com".into(), "6680".into()])
        );
    }

    #[test]
    fn parses_keystore_subcommand() {
        let args = Args::parse_from(["netbridge", "keystore", "alice", "example.com", "7000"]);
        match args.command {
            Some(Command::Keystore { tag, host, port, .. }) => {
                assert_eq!(tag, "alice");
                assert_eq!(host, "example.com");
                assert_eq!(port, 7000);
            }
            other => panic!("expected Keystore subcommand, got {:?}", other),
        }
    }

    #[test]
    fn parses_outbound_positional_form() {
        let args = Args::parse_from(["netbridge", "alice@example.com", "7000"]);
        assert_eq!(args.target, Some("alice@example.com".into()));
        assert_eq!(args.target_port, Some(7000));
    }

    #[test]
    fn single_and_no_redirect_flags_parse() {
        let args = Args::parse_from(["netbridge", "-t", "-X", "example.com"]);
        assert!(args.single);
        assert!(args.no_redirect);
    }
}
