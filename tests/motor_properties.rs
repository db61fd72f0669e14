//! End-to-end properties of the motion state machine, exercised against the
//! deterministic simulator.

use std::time::Duration;

use rust_rig::config::Settings;
use rust_rig::hardware::sim::{SimAxis, SimCall, SimHandle};
use rust_rig::motor::{Direction, MotionState, MotorAxis, OpRequest, RigEvent};

/// Settings scaled down so a whole operation fits in tens of milliseconds.
fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.watchdog.poll_interval = Duration::from_millis(10);
    settings.watchdog.settle_delay = Duration::from_millis(20);
    settings.watchdog.min_op_duration = Duration::from_millis(40);
    settings.watchdog.current_wait = Duration::from_millis(200);
    settings
}

/// Connected axis over a manually scripted simulator that looks busy:
/// healthy current, spinning, no completion flags.
async fn scripted_axis() -> (MotorAxis, SimHandle) {
    let settings = fast_settings();
    let axis = MotorAxis::new(&settings);
    let (sim, handle) = SimAxis::new();
    handle.set_manual(true);
    handle.set_current(40);
    handle.set_velocity(640);
    axis.connect(Box::new(sim)).await.unwrap();
    assert_eq!(axis.state(), MotionState::Idle);
    (axis, handle)
}

fn request() -> OpRequest {
    OpRequest::from_settings(&fast_settings().motor)
}

async fn outcome(axis: &MotorAxis) -> bool {
    tokio::time::timeout(Duration::from_secs(2), axis.wait_complete())
        .await
        .expect("no completion within two seconds")
        .expect("completion channel closed")
}

#[tokio::test]
async fn second_command_while_running_is_rejected_as_busy() {
    let (axis, _handle) = scripted_axis().await;

    axis.move_absolute(1000, request()).await.unwrap();
    assert_eq!(axis.state(), MotionState::Running);

    let err = axis.move_absolute(2000, request()).await.unwrap_err();
    assert!(matches!(err, rust_rig::error::RigError::Busy));
    let err = axis.jog(Direction::Forward, request()).await.unwrap_err();
    assert!(matches!(err, rust_rig::error::RigError::Busy));
    // The in-flight operation is untouched.
    assert_eq!(axis.state(), MotionState::Running);

    // Past the minimum-duration window a clean stop reports success.
    tokio::time::sleep(Duration::from_millis(80)).await;
    axis.stop().await.unwrap();
    assert!(outcome(&axis).await);
}

#[tokio::test]
async fn exactly_one_notification_per_operation() {
    let (axis, handle) = scripted_axis().await;

    axis.move_absolute(500, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.set_target_reached(true);

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);

    // No second notification for the same operation.
    let second = tokio::time::timeout(Duration::from_millis(100), axis.wait_complete()).await;
    assert!(second.is_err());

    // Guard was released exactly once: a new operation is accepted.
    handle.set_target_reached(false);
    axis.move_absolute(600, request()).await.unwrap();
    axis.stop().await.unwrap();
    outcome(&axis).await;
}

#[tokio::test]
async fn stop_twice_on_idle_axis_is_harmless() {
    let (axis, _handle) = scripted_axis().await;

    axis.stop().await.unwrap();
    assert_eq!(axis.state(), MotionState::Idle);
    axis.stop().await.unwrap();
    assert_eq!(axis.state(), MotionState::Idle);

    // Idle stops never produce a completion notification.
    let note = tokio::time::timeout(Duration::from_millis(100), axis.wait_complete()).await;
    assert!(note.is_err());
}

#[tokio::test]
async fn timed_jog_completes_successfully_on_timeout() {
    let (axis, _handle) = scripted_axis().await;

    let bound = Duration::from_millis(150);
    axis.jog(Direction::Forward, request().with_timeout(bound))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
    // Settle delay + bound + at most one poll interval, with slack.
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn current_excess_far_from_target_aborts_as_failure() {
    let (axis, handle) = scripted_axis().await;
    handle.set_position(0);
    handle.set_current(400);

    axis.move_absolute(100_000, request()).await.unwrap();
    assert!(!outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Error);

    // The watchdog still issued its safety stop.
    assert!(handle.journal().contains(&SimCall::Halt(
        rust_rig::hardware::ProfileKind::Position
    )));
}

#[tokio::test]
async fn current_excess_inside_window_counts_as_arrival() {
    let (axis, handle) = scripted_axis().await;
    handle.set_position(99_950);

    axis.move_absolute(100_000, request()).await.unwrap();
    // Let the minimum-duration window pass before the stall shows up.
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.set_current(400);

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
}

#[tokio::test]
async fn spurious_instant_completion_is_flagged_as_failure() {
    let (axis, handle) = scripted_axis().await;

    axis.move_absolute(1000, request()).await.unwrap();
    // Target-reached immediately, long before the minimum duration.
    handle.set_target_reached(true);

    assert!(!outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Error);
}

#[tokio::test]
async fn zero_velocity_jog_is_a_halt_not_an_operation() {
    let (axis, handle) = scripted_axis().await;
    handle.clear_journal();

    axis.jog(Direction::Forward, request().with_velocity(0).with_stall(true))
        .await
        .unwrap();
    assert_eq!(axis.state(), MotionState::Idle);

    let journal = handle.journal();
    assert!(journal.contains(&SimCall::SetQuickStop));
    assert!(journal.contains(&SimCall::SetDisabled));
    assert!(!journal
        .iter()
        .any(|call| matches!(call, SimCall::MoveWithVelocity(_))));

    // No watchdog, no notification.
    let note = tokio::time::timeout(Duration::from_millis(150), axis.wait_complete()).await;
    assert!(note.is_err());
}

#[tokio::test]
async fn stop_cancels_in_flight_jog_without_second_hardware_stop() {
    let (axis, handle) = scripted_axis().await;

    axis.jog(Direction::Backward, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.clear_journal();

    axis.stop().await.unwrap();
    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);

    let journal = handle.journal();
    // The canceller issued the stall release.
    assert!(journal.contains(&SimCall::SetQuickStop));
    // The watchdog did not pile a safety halt on top.
    assert!(!journal
        .iter()
        .any(|call| matches!(call, SimCall::Halt(_))));
}

#[tokio::test]
async fn stop_inside_minimum_window_reports_failure() {
    let (axis, _handle) = scripted_axis().await;

    axis.jog(Direction::Forward, request()).await.unwrap();
    // Immediately cancelled: faster than min_op_duration, so suspect.
    axis.stop().await.unwrap();
    assert!(!outcome(&axis).await);

    // The guard is free again regardless.
    axis.move_absolute(100, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    axis.stop().await.unwrap();
    assert!(outcome(&axis).await);
}

#[tokio::test]
async fn operation_after_stop_starts_cleanly() {
    let (axis, handle) = scripted_axis().await;

    axis.jog(Direction::Forward, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    axis.stop().await.unwrap();
    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);

    // The next operation must not inherit the quick-stop the cancellation
    // left on the drive.
    axis.move_absolute(5000, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.set_target_reached(true);

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
}

#[tokio::test]
async fn position_move_timeout_off_target_fails() {
    let (axis, handle) = scripted_axis().await;
    handle.set_position(0);

    axis.move_absolute(100_000, request().with_timeout(Duration::from_millis(150)))
        .await
        .unwrap();

    assert!(!outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Error);
}

#[tokio::test]
async fn position_move_timeout_inside_window_succeeds() {
    let (axis, handle) = scripted_axis().await;
    handle.set_position(99_950);

    axis.move_absolute(100_000, request().with_timeout(Duration::from_millis(150)))
        .await
        .unwrap();

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
}

#[tokio::test]
async fn busy_rejection_leaves_pending_cancellation_intact() {
    // Slow polls keep the guard held across the rejected command below.
    let mut settings = fast_settings();
    settings.watchdog.poll_interval = Duration::from_millis(50);
    let axis = MotorAxis::new(&settings);
    let (sim, handle) = SimAxis::new();
    handle.set_manual(true);
    handle.set_current(40);
    handle.set_velocity(640);
    axis.connect(Box::new(sim)).await.unwrap();

    axis.jog(Direction::Forward, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    axis.stop().await.unwrap();

    // The watchdog has not observed the cancellation yet; a rejected
    // command in that window must not erase it.
    let err = axis.move_absolute(100, request()).await.unwrap_err();
    assert!(matches!(err, rust_rig::error::RigError::Busy));

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
}

#[tokio::test]
async fn drive_fault_state_fails_the_operation() {
    let (axis, handle) = scripted_axis().await;

    axis.move_absolute(1000, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.set_device_state(rust_rig::hardware::DeviceState::Fault);

    assert!(!outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Error);
}

#[tokio::test]
async fn quick_stop_engaged_terminates_the_operation() {
    let (axis, handle) = scripted_axis().await;

    axis.move_absolute(5000, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.engage_quick_stop();

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
}

#[tokio::test]
async fn quick_stop_source_mismatch_raises_warning_before_completion() {
    let (axis, handle) = scripted_axis().await;
    let mut events = axis.subscribe();

    axis.move_absolute(5000, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    // Dedicated flag says stopped, statusword still reads operation-enabled.
    handle.set_quick_stop_flag(true);

    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);

    let mut saw_warning = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RigEvent::StateChanged(MotionState::Warning)) {
            saw_warning = true;
        }
    }
    assert!(saw_warning, "mismatch must surface as a warning state");
}

#[tokio::test]
async fn drive_settling_to_idle_completes_the_operation() {
    let (axis, handle) = scripted_axis().await;
    // Spinning slower than the idle threshold.
    handle.set_velocity(5);

    axis.jog(Direction::Forward, request()).await.unwrap();
    assert!(outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Idle);
}

#[tokio::test]
async fn hardware_fault_during_polling_fails_the_operation() {
    let (axis, handle) = scripted_axis().await;

    axis.move_absolute(1000, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.fail_next_call(rust_rig::hardware::HardwareError::new(
        0x1000_0001,
        "bus dropped",
    ));

    assert!(!outcome(&axis).await);
    assert_eq!(axis.state(), MotionState::Error);

    // The guard must not stay held after an internal failure.
    axis.move_absolute(2000, request()).await.unwrap();
    axis.stop().await.unwrap();
    outcome(&axis).await;
}

#[tokio::test]
async fn home_defines_the_current_position_as_origin() {
    let (axis, handle) = scripted_axis().await;
    handle.set_position(42_000);
    handle.clear_journal();

    axis.home().await.unwrap();
    assert_eq!(axis.state(), MotionState::Idle);
    // Stall release first, then the homing sequence.
    assert_eq!(
        handle.journal(),
        vec![
            SimCall::SetQuickStop,
            SimCall::SetDisabled,
            SimCall::ClearFaults,
            SimCall::ActivateProfile(rust_rig::hardware::ProfileKind::Homing),
            SimCall::SetEnabled,
            SimCall::DefinePosition(0),
        ]
    );
    assert_eq!(axis.last_position(), 0);
    assert_eq!(axis.position().await, 0);
}

#[tokio::test]
async fn commands_require_a_connected_axis() {
    let settings = fast_settings();
    let axis = MotorAxis::new(&settings);

    let err = axis.move_absolute(100, request()).await.unwrap_err();
    assert!(matches!(err, rust_rig::error::RigError::NotConnected));
    let err = axis.home().await.unwrap_err();
    assert!(matches!(err, rust_rig::error::RigError::NotConnected));
    // Stop and disconnect stay harmless while off.
    axis.stop().await.unwrap();
    axis.disconnect().await.unwrap();
    assert_eq!(axis.state(), MotionState::Off);
}

#[tokio::test]
async fn disconnect_during_operation_tears_down_cleanly() {
    let (axis, handle) = scripted_axis().await;

    axis.jog(Direction::Forward, request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    axis.disconnect().await.unwrap();

    assert_eq!(axis.state(), MotionState::Off);
    assert!(handle.journal().contains(&SimCall::Disconnect));

    // Telemetry after teardown degrades to zero instead of failing.
    assert_eq!(axis.position().await, 0);
}
