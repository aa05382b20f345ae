//! Remote console commands
//!
//! Commands run on behalf of either an authenticated client or the local
//! server console. The issuer's level decides which commands are visible
//! and executable.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use tracing::info;

use super::auth::AuthLevel;
use super::name_ban::NameBan;
use super::Server;
use crate::game::simulation::Simulation;
use crate::net::connection::ClientState;
use crate::net::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub name: &'static str,
    pub params: &'static str,
    pub help: &'static str,
    pub level: AuthLevel,
}

const fn cmd(name: &'static str, params: &'static str, help: &'static str, level: AuthLevel) -> CommandInfo {
    CommandInfo {
        name,
        params,
        help,
        level,
    }
}

pub const COMMANDS: &[CommandInfo] = &[
    cmd("status", "?r[name]", "List players containing name or all players", AuthLevel::Helper),
    cmd("logout", "", "Logout of rcon", AuthLevel::Helper),
    cmd("kick", "i[id] ?r[reason]", "Kick player with specified id for any reason", AuthLevel::Moderator),
    cmd("unban", "s[address]", "Unban an IP address", AuthLevel::Moderator),
    cmd("show_ips", "?i[show]", "Show IP addresses in rcon commands (1 = on, 0 = off)", AuthLevel::Moderator),
    cmd("shutdown", "?r[reason]", "Shut down", AuthLevel::Admin),
    cmd("record", "?s[file]", "Record to a file", AuthLevel::Admin),
    cmd("stoprecord", "", "Stop recording", AuthLevel::Admin),
    cmd("reload", "", "Reload the map", AuthLevel::Admin),
    cmd("auth_add", "s[ident] s[level] r[pw]", "Add a rcon key", AuthLevel::Admin),
    cmd("auth_change", "s[ident] s[level] r[pw]", "Update a rcon key", AuthLevel::Admin),
    cmd("auth_remove", "s[ident]", "Remove a rcon key", AuthLevel::Admin),
    cmd("auth_list", "", "List all rcon keys", AuthLevel::Admin),
    cmd(
        "name_ban",
        "s[name] ?i[distance] ?i[is_substring] ?r[reason]",
        "Ban a certain nickname",
        AuthLevel::Admin,
    ),
    cmd("name_unban", "s[name]", "Unban a certain nickname", AuthLevel::Admin),
    cmd("name_bans", "", "List all name bans", AuthLevel::Admin),
];

/// Indices into [`COMMANDS`] usable at `level`
pub fn visible_commands(level: AuthLevel) -> VecDeque<usize> {
    COMMANDS
        .iter()
        .enumerate()
        .filter(|(_, info)| level >= info.level)
        .map(|(idx, _)| idx)
        .collect()
}

fn find_command(name: &str) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|info| info.name == name)
}

/// Split a command line into words. Double quotes group words and `\"`
/// escapes a quote inside them.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' if chars.peek() == Some(&'"') => {
                        arg.push('"');
                        chars.next();
                    }
                    c => arg.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                arg.push(c);
            }
        }
        args.push(arg);
    }
    args
}

fn describe_ban(ban: &NameBan) -> String {
    format!(
        "name='{}' distance={} is_substring={} reason='{}'",
        ban.name, ban.distance, ban.is_substring as i32, ban.reason
    )
}

/// Words from `from` on joined back together, for trailing `r[...]` params
fn rest(args: &[String], from: usize) -> String {
    args.get(from..).map(|rest| rest.join(" ")).unwrap_or_default()
}

impl<S: Simulation, T: Transport> Server<S, T> {
    /// Execute one console line at the current issuer's level and return
    /// the output lines
    pub fn execute_command(&mut self, line: &str) -> Vec<String> {
        let args = tokenize(line);
        let Some((name, args)) = args.split_first() else {
            return Vec::new();
        };
        let Some(info) = find_command(name) else {
            return vec![format!("No such command: {}.", name)];
        };
        if self.rcon_level < info.level {
            return vec![format!("Insufficient permissions to execute '{}'.", name)];
        }

        match info.name {
            "status" => self.cmd_status(args.first().map(String::as_str)),
            "logout" => {
                if let Some(client) = self.rcon_client {
                    self.logout_client(client, None);
                }
                Vec::new()
            }
            "kick" => self.cmd_kick(args),
            "unban" => self.cmd_unban(args),
            "show_ips" => self.cmd_show_ips(args),
            "shutdown" => {
                let reason = rest(args, 0);
                info!("shutdown requested via console: '{}'", reason);
                if reason.is_empty() {
                    self.shutdown();
                } else {
                    self.shutdown_with_reason(format!("Server shutdown ({})", reason));
                }
                Vec::new()
            }
            "record" => {
                let file = args
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("auto-{}", self.tick));
                match self.start_server_record(&file) {
                    Ok(()) => vec![format!("Recording to '{}'", file)],
                    Err(e) => vec![format!("Failed to start recording: {}", e)],
                }
            }
            "stoprecord" => {
                self.stop_server_record();
                vec!["Recording stopped".to_string()]
            }
            "reload" => {
                self.request_map_reload();
                Vec::new()
            }
            "auth_add" | "auth_change" => self.cmd_auth_set(info.name == "auth_add", args),
            "auth_remove" => self.cmd_auth_remove(args),
            "auth_list" => self
                .auth
                .list()
                .into_iter()
                .map(|(ident, level)| format!("{} {}", ident, level.name()))
                .collect(),
            "name_ban" => self.cmd_name_ban(args),
            "name_unban" => {
                let Some(name) = args.first() else {
                    return vec!["Usage: name_unban <name>".to_string()];
                };
                match self.name_bans.remove(name) {
                    Some(ban) => vec![format!("removed {}", describe_ban(&ban))],
                    None => vec![format!("name ban '{}' not found", name)],
                }
            }
            "name_bans" => self
                .name_bans
                .iter()
                .map(describe_ban)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn issuer_sees_ips(&self) -> bool {
        match self.rcon_client {
            Some(client) => self.clients[client].show_ips,
            None => true,
        }
    }

    fn cmd_status(&self, filter: Option<&str>) -> Vec<String> {
        let show_ips = self.issuer_sees_ips();
        let filter = filter.map(str::to_lowercase);
        let mut lines = Vec::new();

        for (id, slot) in self.clients.iter().enumerate() {
            if slot.is_empty() {
                continue;
            }
            if let Some(filter) = &filter {
                if !slot.name.to_lowercase().contains(filter.as_str()) {
                    continue;
                }
            }
            let addr = match slot.addr {
                Some(addr) if show_ips => addr.to_string(),
                Some(_) => "<hidden>".to_string(),
                None => "-".to_string(),
            };
            let line = match slot.state {
                ClientState::InGame => {
                    let key = match slot.auth_key.and_then(|key| self.auth.key_ident(key)) {
                        Some(ident) => format!(" key={} ({})", ident, slot.auth_level.name()),
                        None => String::new(),
                    };
                    format!(
                        "id={} addr={} name='{}' score={} flags={} dnsbl={}{}",
                        id,
                        addr,
                        slot.name,
                        slot.score,
                        slot.flags,
                        slot.dnsbl.name(),
                        key
                    )
                }
                ClientState::Dummy => format!("id={} name='{}' dummy=yes", id, slot.name),
                _ => format!("id={} addr={} connecting", id, addr),
            };
            lines.push(line);
        }
        lines
    }

    fn cmd_unban(&mut self, args: &[String]) -> Vec<String> {
        let Some(arg) = args.first() else {
            return vec!["Usage: unban <address>".to_string()];
        };
        let ip = match arg.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match arg.parse::<SocketAddr>() {
                Ok(addr) => addr.ip(),
                Err(_) => return vec![format!("invalid address '{}'", arg)],
            },
        };
        if self.bans.unban(ip) {
            info!("unbanned {}", ip);
            vec![format!("unbanned {}", ip)]
        } else {
            vec![format!("{} is not banned", ip)]
        }
    }

    fn cmd_kick(&mut self, args: &[String]) -> Vec<String> {
        let Some(Ok(client)) = args.first().map(|arg| arg.parse::<usize>()) else {
            return vec!["Usage: kick <id> [reason]".to_string()];
        };
        let reason = match rest(args, 1) {
            reason if reason.is_empty() => "Kicked by console".to_string(),
            reason => format!("Kicked ({})", reason),
        };
        match self.kick(client, &reason) {
            Ok(()) => Vec::new(),
            Err(e) => vec![e.to_string()],
        }
    }

    fn cmd_show_ips(&mut self, args: &[String]) -> Vec<String> {
        let Some(client) = self.rcon_client else {
            return vec!["Can't change this value from the server console".to_string()];
        };
        match args.first().map(String::as_str) {
            None => {
                let state = if self.clients[client].show_ips { "on" } else { "off" };
                vec![format!("Value: {}", state)]
            }
            Some(value) => {
                let on = value != "0";
                self.clients[client].show_ips = on;
                vec![if on { "Showing IPs" } else { "Hiding IPs" }.to_string()]
            }
        }
    }

    fn cmd_auth_set(&mut self, add: bool, args: &[String]) -> Vec<String> {
        let (Some(ident), Some(level)) = (args.first(), args.get(1)) else {
            return vec![format!("Usage: {} <ident> <level> <pw>", if add { "auth_add" } else { "auth_change" })];
        };
        let Some(level) = AuthLevel::parse(level) else {
            return vec!["level can be one of {\"admin\", \"mod(erator)\", \"helper\"}".to_string()];
        };
        let password = rest(args, 2);

        if add {
            return match self.auth.add_key(ident, &password, level) {
                Ok(_) => vec!["Successfully added key".to_string()],
                Err(e) => vec![e.to_string()],
            };
        }
        match self.auth.update_key(ident, &password, level) {
            Ok(key) => {
                self.logout_key(key, "key update");
                vec!["Successfully updated key".to_string()]
            }
            Err(e) => vec![e.to_string()],
        }
    }

    fn cmd_auth_remove(&mut self, args: &[String]) -> Vec<String> {
        let Some(ident) = args.first() else {
            return vec!["Usage: auth_remove <ident>".to_string()];
        };
        match self.auth.remove_key(ident) {
            Ok(key) => {
                self.logout_key(key, "key removal");
                vec!["Successfully removed key".to_string()]
            }
            Err(e) => vec![e.to_string()],
        }
    }

    fn cmd_name_ban(&mut self, args: &[String]) -> Vec<String> {
        let Some(name) = args.first() else {
            return vec!["Usage: name_ban <name> [distance] [is_substring] [reason]".to_string()];
        };
        let distance = args
            .get(1)
            .and_then(|arg| arg.parse().ok())
            .unwrap_or(name.chars().count() / 3);
        let is_substring = args.get(2).is_some_and(|arg| arg != "0");
        let ban = NameBan {
            name: name.clone(),
            distance,
            is_substring,
            reason: rest(args, 3),
        };
        let line = describe_ban(&ban);
        match self.name_bans.upsert(ban) {
            Some(_) => vec![format!("changed {}", line)],
            None => vec![format!("added {}", line)],
        }
    }
}
