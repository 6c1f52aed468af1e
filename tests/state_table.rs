use cyclos::{AppState, ChannelState};

#[test]
fn legal_channel_transitions_are_accepted() {
    let state = ChannelState::Unwrapped;
    let state = state.transition(ChannelState::Handshaking);
    let state = state.transition(ChannelState::Open);
    let state = state.transition(ChannelState::Flushing);
    let state = state.transition(ChannelState::ShuttingDown);
    let state = state.transition(ChannelState::Unwrapped);
    assert_eq!(state, ChannelState::Unwrapped);
}

#[test]
fn open_can_shut_down_without_flushing() {
    let state = ChannelState::Open.transition(ChannelState::ShuttingDown);
    assert_eq!(state, ChannelState::ShuttingDown);
}

#[test]
fn every_state_can_tear_down() {
    for state in [
        ChannelState::Unwrapped,
        ChannelState::Handshaking,
        ChannelState::Open,
        ChannelState::Flushing,
        ChannelState::ShuttingDown,
    ] {
        assert!(state.can_transition(ChannelState::Unwrapped));
    }
}

#[test]
#[should_panic(expected = "invalid secure-channel transition")]
fn reopening_a_handshake_panics() {
    let _ = ChannelState::Open.transition(ChannelState::Handshaking);
}

#[test]
#[should_panic(expected = "invalid secure-channel transition")]
fn skipping_the_handshake_panics() {
    let _ = ChannelState::Unwrapped.transition(ChannelState::Open);
}

#[test]
#[should_panic(expected = "invalid secure-channel transition")]
fn shutting_down_cannot_resume() {
    let _ = ChannelState::ShuttingDown.transition(ChannelState::Open);
}

#[test]
fn app_state_only_moves_forward() {
    let mut state = AppState::Init;

    assert!(state.advance(AppState::ConnectionMade));
    assert!(state.advance(AppState::EndOfFile));

    // Regressions are refused, repeats included.
    assert!(!state.advance(AppState::ConnectionMade));
    assert!(!state.advance(AppState::EndOfFile));

    assert!(state.advance(AppState::ConnectionLost));
    assert!(!state.advance(AppState::ConnectionLost));
}

#[test]
fn end_of_file_can_be_skipped() {
    let mut state = AppState::ConnectionMade;
    assert!(state.advance(AppState::ConnectionLost));
    assert_eq!(state, AppState::ConnectionLost);
}
