//! Test utilities & fixtures.
//! Builds bridges over a scripted modem and a throwaway sled registry.

use std::sync::Arc;

use gsmbridge::config::Config;
use gsmbridge::fleet::Bridge;
use gsmbridge::modem::mock::MockModem;

#[allow(dead_code)]
pub const PORT0: &str = "/dev/ttyUSB0";
#[allow(dead_code)]
pub const PORT1: &str = "/dev/ttyUSB1";
#[allow(dead_code)]
pub const ICCID_A: &str = "89840480001111111111";
#[allow(dead_code)]
pub const IMSI_A: &str = "452040000000001";
#[allow(dead_code)]
pub const ICCID_B: &str = "89840480002222222222";
#[allow(dead_code)]
pub const IMSI_B: &str = "452040000000002";

/// Defaults shrunk so loops and timeouts run in test time.
pub fn test_config(data_dir: &str) -> Config {
    let mut cfg = Config::default();
    cfg.serial.command_timeout_ms = 300;
    cfg.serial.read_poll_ms = 5;
    cfg.serial.connect_budget_ms = 200;
    cfg.serial.connect_retry_delay_ms = 20;
    cfg.polling.discovery_interval_ms = 50;
    cfg.polling.telemetry_interval_ms = 100;
    cfg.polling.balance_interval_ms = 100;
    cfg.polling.port_pacing_ms = 0;
    cfg.polling.error_backoff_ms = 100;
    cfg.commands.ussd_timeout_ms = 500;
    cfg.commands.sms_list_timeout_ms = 500;
    cfg.storage.data_dir = data_dir.to_string();
    cfg.storage.max_retries = 3;
    cfg.storage.base_backoff_ms = 1;
    cfg.storage.max_backoff_ms = 5;
    cfg.logging.level = "error".into();
    cfg
}

/// A bridge on `modem` with its registry in a fresh temp dir. Keep the dir alive.
pub fn bridge(modem: &MockModem) -> (tempfile::TempDir, Bridge) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path().to_str().expect("utf8 path"));
    let bridge = Bridge::open(cfg, Arc::new(modem.clone())).expect("open bridge");
    (dir, bridge)
}

/// Answer `AT+CREG?` with a home registration.
#[allow(dead_code)]
pub fn register_home(modem: &MockModem, port: &str) {
    modem.respond(port, "AT+CREG?", "+CREG: 0,1\r\n\r\nOK\r\n");
}

/// Three messages: a plain number, a digit-encoded "Hello" and an undecodable sender.
#[allow(dead_code)]
pub const LISTING: &str = "\r\n+CMGL: 1,\"REC READ\",\"+84901234567\",,\"26/10/16,09:12:44+28\"\r\n\
Xin chao\r\n\
+CMGL: 2,\"REC UNREAD\",\"72101108108111\",,\"26/10/16,09:13:00+28\"\r\n\
Ma xac thuc 123456\r\n\
+CMGL: 3,\"REC UNREAD\",\"7201\",,\"26/10/16,09:14:00+28\"\r\n\
spam\r\n\
\r\nOK\r\n";

/// Answer the SMS setup commands and list [`LISTING`].
#[allow(dead_code)]
pub fn script_sms(modem: &MockModem, port: &str) {
    modem.respond(port, "AT+CSCS?", "+CSCS: \"IRA\"\r\n\r\nOK\r\n");
    modem.respond(port, "AT+CSCS=\"GSM\"", "\r\nOK\r\n");
    modem.respond(port, "AT+CMGF=1", "\r\nOK\r\n");
    modem.respond(port, "AT+CPMS=\"SM\"", "+CPMS: 3,30,3,30,3,30\r\n\r\nOK\r\n");
    modem.respond(port, "AT+CMGL=\"ALL\"", LISTING);
}
