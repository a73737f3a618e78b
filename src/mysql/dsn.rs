use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ProxyError, Result};

const DEFAULT_TCP_ADDR: &str = "127.0.0.1:3306";
const DEFAULT_UNIX_ADDR: &str = "/tmp/mysql.sock";
const DEFAULT_PORT: &str = "3306";

/// Parsed backend data-source name:
/// `user:password@net[(addr)]/dbname[?param=value&...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsnConfig {
    pub user: String,
    pub passwd: String,
    pub net: String,
    pub addr: String,
    pub db_name: String,

    pub allow_all_files: bool,
    pub allow_cleartext_passwords: bool,
    pub allow_native_passwords: bool,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tls: Option<String>,
    pub max_allowed_packet: Option<usize>,
    pub interpolate_params: bool,
    pub multi_statements: bool,
    pub parse_time: bool,
    pub loc: Option<String>,

    /// Parameters outside the recognized set, preserved verbatim.
    pub params: BTreeMap<String, String>,
}

impl Default for DsnConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            passwd: String::new(),
            net: "tcp".to_string(),
            addr: DEFAULT_TCP_ADDR.to_string(),
            db_name: String::new(),
            allow_all_files: false,
            allow_cleartext_passwords: false,
            allow_native_passwords: true,
            charset: None,
            collation: None,
            timeout: None,
            read_timeout: None,
            write_timeout: None,
            tls: None,
            max_allowed_packet: None,
            interpolate_params: false,
            multi_statements: false,
            parse_time: false,
            loc: None,
            params: BTreeMap::new(),
        }
    }
}

impl DsnConfig {
    pub fn parse(dsn: &str) -> Result<Self> {
        let mut cfg = DsnConfig::default();

        // The db name starts at the last '/': passwords and unix socket
        // paths may themselves contain slashes.
        let slash = dsn
            .rfind('/')
            .ok_or_else(|| ProxyError::DsnParse(format!("missing '/' separator in {:?}", dsn)))?;
        let head = &dsn[..slash];
        let tail = &dsn[slash + 1..];

        let (db_part, param_part) = match tail.find('?') {
            Some(q) => (&tail[..q], Some(&tail[q + 1..])),
            None => (tail, None),
        };
        cfg.db_name = db_part.to_string();

        // userinfo ends at the last '@' of the head
        let netloc = match head.rfind('@') {
            Some(at) => {
                let userinfo = &head[..at];
                match userinfo.find(':') {
                    Some(colon) => {
                        cfg.user = userinfo[..colon].to_string();
                        cfg.passwd = userinfo[colon + 1..].to_string();
                    }
                    None => cfg.user = userinfo.to_string(),
                }
                &head[at + 1..]
            }
            None => head,
        };

        // net[(addr)]
        if let Some(open) = netloc.find('(') {
            if !netloc.ends_with(')') {
                return Err(ProxyError::DsnParse(format!(
                    "unclosed address in {:?}",
                    dsn
                )));
            }
            cfg.net = netloc[..open].to_string();
            cfg.addr = netloc[open + 1..netloc.len() - 1].to_string();
        } else {
            cfg.net = netloc.to_string();
        }
        if cfg.net.is_empty() {
            cfg.net = "tcp".to_string();
        }

        match cfg.net.as_str() {
            "tcp" => {
                if cfg.addr.is_empty() {
                    cfg.addr = DEFAULT_TCP_ADDR.to_string();
                } else if !cfg.addr.contains(':') {
                    cfg.addr = format!("{}:{}", cfg.addr, DEFAULT_PORT);
                }
            }
            "unix" => {
                if cfg.addr.is_empty() {
                    cfg.addr = DEFAULT_UNIX_ADDR.to_string();
                }
            }
            other => {
                return Err(ProxyError::DsnParse(format!(
                    "default addr for network {:?} unknown",
                    other
                )));
            }
        }

        if let Some(params) = param_part {
            cfg.parse_params(params)?;
        }

        Ok(cfg)
    }

    fn parse_params(&mut self, params: &str) -> Result<()> {
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ProxyError::DsnParse(format!("malformed parameter {:?}", pair)))?;
            match key {
                "allowAllFiles" => self.allow_all_files = parse_bool(key, value)?,
                "allowCleartextPasswords" => {
                    self.allow_cleartext_passwords = parse_bool(key, value)?
                }
                "allowNativePasswords" => self.allow_native_passwords = parse_bool(key, value)?,
                "charset" => self.charset = Some(value.to_string()),
                "collation" => self.collation = Some(value.to_string()),
                "timeout" => self.timeout = Some(parse_duration(key, value)?),
                "readTimeout" => self.read_timeout = Some(parse_duration(key, value)?),
                "writeTimeout" => self.write_timeout = Some(parse_duration(key, value)?),
                "tls" => self.tls = Some(value.to_string()),
                "maxAllowedPacket" => {
                    self.max_allowed_packet = Some(value.parse().map_err(|_| {
                        ProxyError::DsnParse(format!("invalid maxAllowedPacket {:?}", value))
                    })?)
                }
                "interpolateParams" => self.interpolate_params = parse_bool(key, value)?,
                "multiStatements" => self.multi_statements = parse_bool(key, value)?,
                "parseTime" => self.parse_time = parse_bool(key, value)?,
                "loc" => self.loc = Some(value.to_string()),
                _ => {
                    self.params.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(())
    }

    /// Serializes back to DSN text. `parse(format_dsn(parse(s)))` equals
    /// `parse(s)` for every accepted input.
    pub fn format_dsn(&self) -> String {
        let mut out = String::new();
        if !self.user.is_empty() {
            out.push_str(&self.user);
            if !self.passwd.is_empty() {
                out.push(':');
                out.push_str(&self.passwd);
            }
            out.push('@');
        }
        out.push_str(&self.net);
        out.push('(');
        out.push_str(&self.addr);
        out.push(')');
        out.push('/');
        out.push_str(&self.db_name);

        let mut params: Vec<(String, String)> = Vec::new();
        if self.allow_all_files {
            params.push(("allowAllFiles".into(), "true".into()));
        }
        if self.allow_cleartext_passwords {
            params.push(("allowCleartextPasswords".into(), "true".into()));
        }
        if !self.allow_native_passwords {
            params.push(("allowNativePasswords".into(), "false".into()));
        }
        if let Some(v) = &self.charset {
            params.push(("charset".into(), v.clone()));
        }
        if let Some(v) = &self.collation {
            params.push(("collation".into(), v.clone()));
        }
        if let Some(v) = self.timeout {
            params.push(("timeout".into(), format_duration(v)));
        }
        if let Some(v) = self.read_timeout {
            params.push(("readTimeout".into(), format_duration(v)));
        }
        if let Some(v) = self.write_timeout {
            params.push(("writeTimeout".into(), format_duration(v)));
        }
        if let Some(v) = &self.tls {
            params.push(("tls".into(), v.clone()));
        }
        if let Some(v) = self.max_allowed_packet {
            params.push(("maxAllowedPacket".into(), v.to_string()));
        }
        if self.interpolate_params {
            params.push(("interpolateParams".into(), "true".into()));
        }
        if self.multi_statements {
            params.push(("multiStatements".into(), "true".into()));
        }
        if self.parse_time {
            params.push(("parseTime".into(), "true".into()));
        }
        if let Some(v) = &self.loc {
            params.push(("loc".into(), v.clone()));
        }
        for (k, v) in &self.params {
            params.push((k.clone(), v.clone()));
        }

        for (i, (k, v)) in params.iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ProxyError::DsnParse(format!(
            "invalid boolean for {}: {:?}",
            key, value
        ))),
    }
}

/// Single-unit durations: `300ms`, `30s`, `2m`, `1h`.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let bad = || ProxyError::DsnParse(format!("invalid duration for {}: {:?}", key, value));
    let (digits, unit) = value.split_at(value.find(|c: char| !c.is_ascii_digit()).ok_or_else(bad)?);
    let amount: u64 = digits.parse().map_err(|_| bad())?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(bad()),
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || (d.as_secs() == 0 && !d.is_zero()) {
        format!("{}ms", d.as_millis())
    } else if d.as_secs() % 3600 == 0 && d.as_secs() != 0 {
        format!("{}h", d.as_secs() / 3600)
    } else if d.as_secs() % 60 == 0 && d.as_secs() != 0 {
        format!("{}m", d.as_secs() / 60)
    } else {
        format!("{}s", d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dsn_without_database() {
        assert!(DsnConfig::parse("admin:123456@tcp").is_err());
    }

    #[test]
    fn rejects_bare_host_network() {
        assert!(DsnConfig::parse("admin:123456@127.0.0.1:3306/pass").is_err());
    }

    #[test]
    fn tcp_default_address() {
        let cfg = DsnConfig::parse("admin:123456@tcp/pass").unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:3306");
        assert_eq!(cfg.user, "admin");
        assert_eq!(cfg.passwd, "123456");
        assert_eq!(cfg.db_name, "pass");
    }

    #[test]
    fn unix_default_address() {
        let cfg = DsnConfig::parse("admin:123456@unix/pass").unwrap();
        assert_eq!(cfg.addr, "/tmp/mysql.sock");
        assert_eq!(cfg.user, "admin");
        assert_eq!(cfg.passwd, "123456");
        assert_eq!(cfg.db_name, "pass");
    }

    #[test]
    fn explicit_address_with_and_without_port() {
        let cfg = DsnConfig::parse("admin:123456@tcp(127.0.0.1:3306)/pass").unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:3306");

        let cfg = DsnConfig::parse("admin:123456@tcp(127.0.0.1)/pass").unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:3306");
        assert_eq!(cfg.db_name, "pass");
    }

    #[test]
    fn recognized_parameters() {
        let cfg = DsnConfig::parse(
            "admin:123456@tcp(127.0.0.1:3306)/pass?allowAllFiles=true&allowCleartextPasswords=true",
        )
        .unwrap();
        assert!(cfg.allow_all_files);
        assert!(cfg.allow_cleartext_passwords);

        let clone = cfg.clone();
        assert_eq!(clone.addr, "127.0.0.1:3306");
        assert_eq!(clone.user, "admin");
        assert_eq!(clone.passwd, "123456");
        assert_eq!(clone.db_name, "pass");
        assert!(clone.allow_all_files);
        assert!(clone.allow_cleartext_passwords);
    }

    #[test]
    fn timeouts_and_packet_cap() {
        let cfg = DsnConfig::parse(
            "u:p@tcp(10.0.0.1)/db?timeout=30s&readTimeout=500ms&maxAllowedPacket=16777216",
        )
        .unwrap();
        assert_eq!(cfg.timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.read_timeout, Some(Duration::from_millis(500)));
        assert_eq!(cfg.max_allowed_packet, Some(16777216));
    }

    #[test]
    fn unknown_parameters_preserved() {
        let cfg = DsnConfig::parse("u:p@tcp/db?foo=bar").unwrap();
        assert_eq!(cfg.params.get("foo").map(String::as_str), Some("bar"));
    }

    #[test]
    fn malformed_parameter_rejected() {
        assert!(DsnConfig::parse("u:p@tcp/db?allowAllFiles").is_err());
        assert!(DsnConfig::parse("u:p@tcp/db?timeout=soon").is_err());
    }

    #[test]
    fn round_trip_stability() {
        for dsn in [
            "admin:123456@tcp/pass",
            "admin:123456@unix/pass",
            "admin:123456@tcp(127.0.0.1)/pass",
            "admin:123456@tcp(10.1.2.3:3307)/db?allowAllFiles=true&timeout=30s",
            "u:p@unix(/var/run/mysqld/mysqld.sock)/db?parseTime=true&loc=Local",
            "u:p@tcp/db?foo=bar&multiStatements=true",
        ] {
            let once = DsnConfig::parse(dsn).unwrap();
            let twice = DsnConfig::parse(&once.format_dsn()).unwrap();
            assert_eq!(once, twice, "round trip failed for {}", dsn);
        }
    }
}
