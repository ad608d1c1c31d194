//! FSM unit tests

use deployd::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};

fn advance(fsm: &mut DeploymentFsm, events: &[DeploymentEvent]) {
    for event in events {
        fsm.process(event.clone()).unwrap();
    }
}

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Queued);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_service_flow() {
    let mut fsm = DeploymentFsm::new();
    advance(
        &mut fsm,
        &[
            DeploymentEvent::Start,
            DeploymentEvent::Fetched,
            DeploymentEvent::Installed,
            DeploymentEvent::Built,
            DeploymentEvent::ServiceUp,
        ],
    );
    assert_eq!(fsm.state(), DeploymentState::Running);

    // A running service never completes on its own
    assert!(fsm.process(DeploymentEvent::Completed).is_err());
    assert_eq!(fsm.process(DeploymentEvent::Cancel), Ok(DeploymentState::Cancelled));
}

#[test]
fn test_fsm_cancel_from_every_live_state() {
    let paths: Vec<Vec<DeploymentEvent>> = vec![
        vec![],
        vec![DeploymentEvent::Start],
        vec![DeploymentEvent::Start, DeploymentEvent::Fetched],
        vec![
            DeploymentEvent::Start,
            DeploymentEvent::Fetched,
            DeploymentEvent::Installed,
        ],
        vec![
            DeploymentEvent::Start,
            DeploymentEvent::Fetched,
            DeploymentEvent::InstalledNoBuild,
        ],
        vec![
            DeploymentEvent::Start,
            DeploymentEvent::Fetched,
            DeploymentEvent::InstalledNoBuild,
            DeploymentEvent::ServiceUp,
        ],
    ];

    for path in paths {
        let mut fsm = DeploymentFsm::new();
        advance(&mut fsm, &path);
        let before = fsm.state();
        assert_eq!(
            fsm.process(DeploymentEvent::Cancel),
            Ok(DeploymentState::Cancelled),
            "cancel from {}",
            before
        );
        assert!(fsm.error().is_none());
    }
}

#[test]
fn test_fsm_failure_records_reason() {
    let mut fsm = DeploymentFsm::new();
    advance(&mut fsm, &[DeploymentEvent::Start]);
    fsm.process(DeploymentEvent::Fail("repository not found".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeploymentState::Failed);
    assert_eq!(fsm.error(), Some("repository not found"));
    assert!(fsm.process(DeploymentEvent::Cancel).is_err());
}

#[test]
fn test_fsm_state_classification() {
    use DeploymentState::*;

    for state in [Queued, Fetching, Installing, Building, Starting] {
        assert!(!state.is_terminal(), "{}", state);
        assert!(!state.is_final(), "{}", state);
    }
    assert!(Running.is_terminal());
    assert!(!Running.is_final());
    for state in [Succeeded, Failed, Cancelled] {
        assert!(state.is_terminal(), "{}", state);
        assert!(state.is_final(), "{}", state);
    }
}

#[test]
fn test_fsm_state_names() {
    assert_eq!(DeploymentState::Installing.to_string(), "installing");
    assert_eq!(
        serde_json::to_string(&DeploymentState::Cancelled).unwrap(),
        "\"cancelled\""
    );
}
