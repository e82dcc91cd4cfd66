//! RFC 5424 syslog framing and the UDP forwarder task.

use chrono::SecondsFormat;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::*;
use webssh2_common::{LogLevel, SyslogConfig};

use super::record::LogRecord;
use super::LogError;

fn severity(level: LogLevel) -> u8 {
    match level {
        LogLevel::Debug => 7,
        LogLevel::Info => 6,
        LogLevel::Warn => 4,
        LogLevel::Error => 3,
    }
}

fn escape_sd_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ']' => out.push_str("\\]"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

/// Formats one record as `<PRI>1 TIMESTAMP HOST APP PID MSGID [SD] MSG`.
/// The structured-data element carries the well-known context fields.
pub fn format_rfc5424(
    record: &LogRecord,
    config: &SyslogConfig,
    hostname: &str,
    pid: u32,
) -> Result<String, LogError> {
    let pri = (config.facility.code() as u16) * 8 + severity(record.level) as u16;
    let timestamp = record.ts.to_rfc3339_opts(SecondsFormat::Millis, true);

    let mut sd_params = vec![("event", record.event.clone())];
    let context = &record.context;
    let optional = [
        ("session_id", context.session_id.as_ref()),
        ("request_id", context.request_id.as_ref()),
        ("username", context.username.as_ref()),
        ("client_ip", context.client_ip.as_ref()),
        ("target_host", context.target_host.as_ref()),
        ("connection_id", context.connection_id.as_ref()),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            sd_params.push((name, value.clone()));
        }
    }
    if let Some(status) = context.status {
        let status = match status {
            super::record::LogStatus::Success => "success",
            super::record::LogStatus::Failure => "failure",
        };
        sd_params.push(("status", status.to_string()));
    }

    let sd = sd_params
        .iter()
        .map(|(name, value)| format!("{name}=\"{}\"", escape_sd_value(value)))
        .collect::<Vec<_>>()
        .join(" ");

    let msg = if config.include_json {
        record.to_json()?
    } else {
        record.message.clone().unwrap_or_default()
    };

    Ok(format!(
        "<{pri}>1 {timestamp} {hostname} {app} {pid} {msgid} [webssh2@{eid} {sd}] {msg}",
        app = config.app_name,
        msgid = record.event,
        eid = config.enterprise_id,
    ))
}

/// Spawns the forwarder task: a single writer draining the queue in
/// publication order onto a UDP socket.
pub fn start_syslog_transport(config: SyslogConfig) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(1024);
    tokio::spawn(async move {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(error) => {
                eprintln!("Failed to create the syslog socket: {error}");
                return;
            }
        };
        let target = format!("{}:{}", config.host, config.port);
        while let Some(line) = rx.recv().await {
            if let Err(error) = socket.send_to(line.as_bytes(), &target).await {
                warn!(%error, "Failed to forward log entry to syslog");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use webssh2_common::LogLevel;

    use super::super::record::{LogRecord, LogStatus};
    use super::*;

    fn config() -> SyslogConfig {
        SyslogConfig::default()
    }

    #[test]
    fn test_rfc5424_framing() {
        let record = LogRecord::new(LogLevel::Info, "session_start").with_message("m");
        let line = format_rfc5424(&record, &config(), "gw01", 4242).unwrap();
        // local0 (16 * 8) + info (6)
        assert!(line.starts_with("<134>1 "), "got: {line}");
        assert!(line.contains("[webssh2@32473 event=\"session_start\""));
        assert!(line.contains(" gw01 webssh2 4242 session_start "));
        assert!(line.ends_with(" m"), "got: {line}");
    }

    #[test]
    fn test_severity_mapping() {
        for (level, pri) in [
            (LogLevel::Debug, 135),
            (LogLevel::Info, 134),
            (LogLevel::Warn, 132),
            (LogLevel::Error, 131),
        ] {
            let record = LogRecord::new(level, "session_start");
            let line = format_rfc5424(&record, &config(), "h", 1).unwrap();
            assert!(line.starts_with(&format!("<{pri}>1 ")));
        }
    }

    #[test]
    fn test_sd_value_escaping() {
        let mut record = LogRecord::new(LogLevel::Info, "auth_failure");
        record.context.username = Some(r#"we"ird]na\me"#.into());
        let line = format_rfc5424(&record, &config(), "h", 1).unwrap();
        assert!(line.contains(r#"username="we\"ird\]na\\me""#));
    }

    #[test]
    fn test_context_fields_in_sd() {
        let mut record = LogRecord::new(LogLevel::Info, "ssh_connect");
        record.context.session_id = Some("s1".into());
        record.context.target_host = Some("example.net".into());
        record.context.status = Some(LogStatus::Success);
        let line = format_rfc5424(&record, &config(), "h", 1).unwrap();
        assert!(line.contains("session_id=\"s1\""));
        assert!(line.contains("target_host=\"example.net\""));
        assert!(line.contains("status=\"success\""));
    }

    #[test]
    fn test_include_json_carries_record() {
        let mut cfg = config();
        cfg.include_json = true;
        let record = LogRecord::new(LogLevel::Info, "session_start").with_message("m");
        let line = format_rfc5424(&record, &cfg, "h", 1).unwrap();
        assert!(line.contains("\"event\":\"session_start\""));
    }
}
