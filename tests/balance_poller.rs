mod common;

use common::*;
use gsmbridge::fleet::balance::{BalanceOutcome, BalancePoller};
use gsmbridge::fleet::discovery::Discovery;
use gsmbridge::fleet::telemetry::TelemetryPoller;
use gsmbridge::fleet::Fleet;
use gsmbridge::modem::decode::RegistrationStatus;
use gsmbridge::modem::mock::MockModem;
use gsmbridge::storage::{SimUpdate, TelemetrySnapshot};

const USSD: &str = "AT+CUSD=1,\"*101#\",15";

async fn registered(modem: &MockModem, fleet: &Fleet) {
    modem.add_sim_modem(PORT0, ICCID_A, IMSI_A);
    register_home(modem, PORT0);
    Discovery::new(fleet.clone()).run_once().await.unwrap();
    TelemetryPoller::new(fleet.clone()).run_once().await.unwrap();
}

#[tokio::test]
async fn balance_is_decoded_and_stored_once_per_window() {
    let modem = MockModem::new();
    let (_dir, bridge) = bridge(&modem);
    let fleet = bridge.fleet().clone();
    registered(&modem, &fleet).await;
    modem.respond(
        PORT0,
        USSD,
        "\r\nOK\r\n\r\n+CUSD: 0,\"TKC 15000 d, han 30/12/2026. TB +84901234567\",15\r\n",
    );

    let poller = BalancePoller::new(fleet.clone());
    let results = poller.run_once().await.unwrap();
    assert_eq!(results.len(), 1);
    match &results[0].1 {
        BalanceOutcome::Updated(record) => {
            assert_eq!(record.balance.as_deref(), Some("15000"));
            assert_eq!(record.phone_number.as_deref(), Some("+84901234567"));
            assert!(record.balance_raw.as_deref().unwrap_or("").contains("TKC 15000"));
            assert!(record.balance_updated_at.is_some());
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // Fresh balance: nothing is due inside the refresh window.
    assert!(poller.run_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_answer_is_skipped() {
    let modem = MockModem::new();
    let (_dir, bridge) = bridge(&modem);
    let fleet = bridge.fleet().clone();
    registered(&modem, &fleet).await;

    let poller = BalancePoller::new(fleet.clone());
    let results = poller.run_once().await.unwrap();
    assert_eq!(results[0].1, BalanceOutcome::Skipped("no answer"));

    modem.respond(PORT0, USSD, "\r\n+CME ERROR: 100\r\n");
    let results = poller.run_once().await.unwrap();
    assert_eq!(results[0].1, BalanceOutcome::Skipped("refused"));
    let record = fleet.registry.find_sim(ICCID_A).await.unwrap().unwrap();
    assert_eq!(record.balance_updated_at, None);
}

#[tokio::test]
async fn unregistered_sims_are_not_queried() {
    let modem = MockModem::new();
    let (_dir, bridge) = bridge(&modem);
    let fleet = bridge.fleet().clone();
    modem.add_sim_modem(PORT0, ICCID_A, IMSI_A);
    Discovery::new(fleet.clone()).run_once().await.unwrap();
    TelemetryPoller::new(fleet.clone()).run_once().await.unwrap();

    assert!(BalancePoller::new(fleet).run_once().await.unwrap().is_empty());
    assert!(!modem.commands_sent(PORT0).iter().any(|c| c.starts_with("AT+CUSD")));
}

#[tokio::test]
async fn untracked_port_defers_query() {
    let modem = MockModem::new();
    let (_dir, bridge) = bridge(&modem);
    let fleet = bridge.fleet().clone();
    registered(&modem, &fleet).await;
    fleet.ports.evict(PORT0, "test").await;

    assert!(BalancePoller::new(fleet.clone()).run_once().await.unwrap().is_empty());
    let record = fleet.registry.find_sim(ICCID_A).await.unwrap().unwrap();
    let outcome = BalancePoller::new(fleet).query(&record).await.unwrap();
    assert_eq!(outcome, BalanceOutcome::Skipped("port not tracked"));
    assert!(!modem.commands_sent(PORT0).iter().any(|c| c.starts_with("AT+CUSD")));
}

#[tokio::test]
async fn stale_bindings_do_not_fill_the_batch() {
    let modem = MockModem::new();
    let (_dir, bridge) = bridge(&modem);
    let fleet = bridge.fleet().clone();
    // Ten SIMs last seen on ports that are gone, sorting ahead of the live one.
    for i in 0..fleet.config.polling.balance_batch {
        let update = SimUpdate {
            telemetry: Some(TelemetrySnapshot {
                registration_status: RegistrationStatus::Home,
                ..TelemetrySnapshot::default()
            }),
            bind_port: Some(format!("/dev/ttyGONE{}", i)),
            balance: None,
        };
        fleet.registry.upsert_sim(&format!("1000{}", i), &update).await.unwrap();
    }
    registered(&modem, &fleet).await;
    modem.respond(PORT0, USSD, "\r\n+CUSD: 0,\"TKC 2500 VND. TB +84901234567\",15\r\n");

    let results = BalancePoller::new(fleet.clone()).run_once().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, ICCID_A);
    assert!(matches!(results[0].1, BalanceOutcome::Updated(_)));
    assert!(modem.commands_sent(PORT0).iter().any(|c| c == USSD));
}
