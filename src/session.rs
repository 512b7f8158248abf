//! Control session: one control connection end to end.
//!
//! The session owns the client protocol and all bookkeeping for one
//! connection. Every mutation happens inside [`Session::run`] (or, in tests,
//! through the same handlers it calls), fed by the transport's event channel,
//! the keepalive timer and commands sent through a [`SessionHandle`].

use crate::client::ClientProtocol;
use crate::config::KeepaliveConfig;
use crate::endpoint::{channel, Emitter, EventReceiver, Link, TransportEvent};
use crate::error::{ControlError, Result};
use crate::transport::TransportHandle;
use crate::types::{CloseReason, ConnectionInfo, Event, VmState};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Request delivered to a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    WantVmState(VmState),
    Close,
}

/// Cloneable, thread-safe way to drive a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Ask the session to move the VM towards `target`
    pub fn want_vm_state(&self, target: VmState) -> Result<()> {
        self.commands
            .send(SessionCommand::WantVmState(target))
            .map_err(|_| ControlError::Closed)
    }

    /// Close the connection. The session ends after the transport reports
    /// the close.
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }
}

/// One control connection with desired-state tracking and keepalive
pub struct Session<L: Link> {
    protocol: ClientProtocol<L>,
    events: EventReceiver<TransportEvent>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    observer: Option<Emitter<Event>>,
    token: String,
    keepalive: KeepaliveConfig,
    keepalive_armed: bool,
    outstanding_pings: u32,
    authenticated: bool,
    vm_state: VmState,
    desired: Option<VmState>,
    /// Reason to report instead of the transport's, when we closed on purpose
    close_reason: Option<CloseReason>,
    closing: bool,
}

impl Session<TransportHandle> {
    /// Open a control connection to `info` on its own I/O thread
    pub fn connect(info: &ConnectionInfo, keepalive: KeepaliveConfig) -> Result<Self> {
        let (emitter, events) = channel();
        info!("Connecting control channel to {}", info);
        let link = TransportHandle::connect(&info.address, info.port, emitter)?;
        Ok(Self::new(link, events, &info.token, keepalive))
    }
}

impl<L: Link> Session<L> {
    /// Build a session over an already-started link and its event stream
    pub fn new(
        link: L,
        events: EventReceiver<TransportEvent>,
        token: &str,
        keepalive: KeepaliveConfig,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        Self {
            protocol: ClientProtocol::new(link),
            events,
            commands_tx,
            commands,
            observer: None,
            token: token.to_string(),
            keepalive,
            keepalive_armed: false,
            outstanding_pings: 0,
            authenticated: false,
            vm_state: VmState::Unknown,
            desired: None,
            close_reason: None,
            closing: false,
        }
    }

    /// Receive every lifecycle event the session sees, ending with `Closed`
    pub fn subscribe(&mut self) -> EventReceiver<Event> {
        let (emitter, rx) = channel();
        self.observer = Some(emitter);
        rx
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Last known VM state
    pub fn vm_state(&self) -> VmState {
        self.vm_state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Ensure the VM eventually reaches `target`.
    ///
    /// Sends at most one command, chosen from the current VM state. The
    /// target is remembered and re-applied whenever a lifecycle event
    /// changes the VM state. Before authentication it is only recorded.
    pub fn want_vm_state(&mut self, target: VmState) {
        self.desired = Some(target);
        self.apply_desired();
    }

    /// Request the connection to close
    pub fn close(&mut self) {
        self.close_with(None);
    }

    /// Drive the session until the connection closes
    pub async fn run(mut self) -> CloseReason {
        let period = self.keepalive.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let was_armed = self.keepalive_armed;
            tokio::select! {
                biased;

                event = self.events.recv() => {
                    let Some(event) = event else {
                        // The I/O thread always reports Closed before it goes away
                        let reason = CloseReason::Io("transport ended without close".into());
                        return self.finish(reason);
                    };
                    if let Some(reason) = self.handle_transport_event(event) {
                        return reason;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = ticker.tick(), if self.keepalive_armed => self.keepalive_tick(),
            }
            if self.keepalive_armed && !was_armed {
                ticker.reset();
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::WantVmState(target) => self.want_vm_state(target),
            SessionCommand::Close => self.close(),
        }
    }

    /// Process one transport event; returns the close reason once the
    /// connection is gone.
    pub(crate) fn handle_transport_event(&mut self, event: TransportEvent) -> Option<CloseReason> {
        match event {
            TransportEvent::Connected => {
                self.notify(Event::Connected);
                if let Err(e) = self.protocol.send_authenticate(&self.token) {
                    self.fail(e);
                }
                None
            }
            TransportEvent::Message(msg) => {
                if self.closing {
                    debug!("Dropping {} received while closing", msg.mtype());
                    return None;
                }
                match self.protocol.dispatch(&msg) {
                    Ok(Some(event)) => self.handle_event(event),
                    Ok(None) => debug!(
                        "Ignored {} in state {:?}",
                        msg.mtype(),
                        self.protocol.state()
                    ),
                    Err(e) => self.fail(e),
                }
                None
            }
            TransportEvent::Closed(reason) => {
                let reason = self.close_reason.take().unwrap_or(reason);
                Some(self.finish(reason))
            }
        }
    }

    fn finish(&mut self, reason: CloseReason) -> CloseReason {
        self.keepalive_armed = false;
        self.closing = true;
        info!("Control session ended: {}", reason);
        self.notify(Event::Closed {
            reason: reason.clone(),
        });
        reason
    }

    fn handle_event(&mut self, event: Event) {
        self.notify(event.clone());
        match event {
            Event::AuthOk { vm_state, name, .. } => {
                info!("Authenticated to VM {} ({})", name, vm_state);
                self.authenticated = true;
                self.vm_state = vm_state;
                self.outstanding_pings = 0;
                self.keepalive_armed = true;
                self.apply_desired();
            }
            Event::AuthFailed { error } => {
                error!("Authentication failed: {}", error);
                self.close_with(Some(CloseReason::AuthFailed(error)));
            }
            Event::ProtocolError { message } => {
                error!("Server reported error: {}", message);
                self.close_with(Some(CloseReason::Protocol(message)));
            }
            Event::VmStarted { .. } => {
                self.vm_state = VmState::Running;
                self.apply_desired();
            }
            Event::VmStopped => {
                self.vm_state = VmState::Stopped;
                self.apply_desired();
            }
            Event::VmDestroyed => {
                self.vm_state = VmState::Destroyed;
                self.apply_desired();
            }
            Event::StartupFailed { message } => {
                warn!("VM startup failed: {}", message);
                self.vm_state = VmState::Stopped;
                self.desired = None;
            }
            Event::StartupRejectedMemory => {
                warn!("VM startup rejected: not enough memory");
                self.vm_state = VmState::Stopped;
                self.desired = None;
            }
            Event::Pong => self.outstanding_pings = 0,
            Event::StartupProgress { .. }
            | Event::AttachingViewer
            | Event::Connected
            | Event::Closed { .. } => {}
        }
    }

    fn apply_desired(&mut self) {
        if !self.authenticated || self.closing {
            return;
        }
        let Some(target) = self.desired else {
            return;
        };
        let result = match (self.vm_state, target) {
            (VmState::Stopped, VmState::Running) => {
                self.protocol.send_start_vm().map(|_| VmState::Starting)
            }
            (VmState::Starting | VmState::Running, VmState::Stopped) => {
                self.protocol.send_stop_vm().map(|_| VmState::Stopping)
            }
            (current, VmState::Destroyed) if current != VmState::Destroyed => {
                self.protocol.send_destroy_vm().map(|_| VmState::Destroyed)
            }
            _ => return,
        };
        match result {
            Ok(state) => {
                debug!("VM state {} -> {} (want {})", self.vm_state, state, target);
                self.vm_state = state;
            }
            Err(e) => self.fail(e),
        }
    }

    /// One keepalive period elapsed
    pub(crate) fn keepalive_tick(&mut self) {
        if !self.keepalive_armed {
            return;
        }
        if self.outstanding_pings < self.keepalive.max_outstanding {
            match self.protocol.send_ping() {
                Ok(()) => self.outstanding_pings += 1,
                Err(e) => self.fail(e),
            }
        } else {
            warn!(
                "No pong after {} pings, closing control connection",
                self.outstanding_pings
            );
            self.close_with(Some(CloseReason::Timeout));
        }
    }

    fn fail(&mut self, err: ControlError) {
        if err.is_programming_error() {
            error!("Control session bug: {}", err);
        } else {
            error!("Control session error: {}", err);
        }
        match err {
            // The transport is already gone and will report why
            ControlError::Closed => self.close_with(None),
            e => self.close_with(Some(CloseReason::Protocol(e.to_string()))),
        }
    }

    fn close_with(&mut self, reason: Option<CloseReason>) {
        if !self.closing {
            self.close_reason = reason;
        }
        self.closing = true;
        self.keepalive_armed = false;
        self.protocol.link().close();
    }

    fn notify(&self, event: Event) {
        if let Some(observer) = &self.observer {
            observer.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::RecordingLink;
    use crate::message::Message;
    use std::time::Duration;

    struct Harness {
        session: Session<RecordingLink>,
        link: RecordingLink,
        observed: EventReceiver<Event>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_keepalive(KeepaliveConfig::default())
        }

        fn with_keepalive(keepalive: KeepaliveConfig) -> Self {
            let (emitter, events) = channel();
            let link = RecordingLink::with_events(emitter);
            let mut session = Session::new(link.clone(), events, "tok", keepalive);
            let observed = session.subscribe();
            Self {
                session,
                link,
                observed,
            }
        }

        fn deliver(&mut self, msg: Message) -> Option<CloseReason> {
            self.session
                .handle_transport_event(TransportEvent::Message(msg))
        }

        /// Connect and authenticate with the VM in `state`
        fn authenticated(state: &str) -> Self {
            let mut h = Self::new();
            h.session.handle_transport_event(TransportEvent::Connected);
            h.deliver(Message::new("auth-ok").with("state", state).with("name", "vm1"));
            h.drain_observed();
            h
        }

        /// Feed back whatever the link reported (its close) and return the
        /// session's verdict
        fn pump_transport(&mut self) -> Option<CloseReason> {
            let mut result = None;
            while let Some(event) = self.session.events.try_recv() {
                result = self.session.handle_transport_event(event);
            }
            result
        }

        fn drain_observed(&mut self) -> Vec<Event> {
            let mut out = Vec::new();
            while let Some(e) = self.observed.try_recv() {
                out.push(e);
            }
            out
        }
    }

    #[test]
    fn connect_then_authenticate() {
        let mut h = Harness::new();
        h.session.handle_transport_event(TransportEvent::Connected);
        assert_eq!(h.link.sent_types(), vec!["authenticate"]);
        assert_eq!(
            h.link.sent.lock().unwrap()[0].get_string("token").unwrap(),
            "tok"
        );

        h.deliver(Message::new("auth-ok").with("state", "running").with("name", "vm1"));
        assert!(h.session.is_authenticated());
        assert_eq!(h.session.vm_state(), VmState::Running);
        assert!(h.session.keepalive_armed);
        assert_eq!(
            h.drain_observed(),
            vec![
                Event::Connected,
                Event::AuthOk {
                    vm_state: VmState::Running,
                    name: "vm1".into(),
                    max_mouse_rate: 0,
                },
            ]
        );
    }

    #[test]
    fn stop_while_starting_sends_one_stop() {
        let mut h = Harness::authenticated("starting");
        h.session.want_vm_state(VmState::Stopped);
        assert_eq!(h.link.sent_types(), vec!["authenticate", "stop-vm"]);
        assert_eq!(h.session.vm_state(), VmState::Stopping);

        h.session.want_vm_state(VmState::Stopped);
        assert_eq!(h.link.sent_types(), vec!["authenticate", "stop-vm"]);
    }

    #[test]
    fn start_is_reissued_when_vm_stops() {
        let mut h = Harness::authenticated("stopped");
        h.session.want_vm_state(VmState::Running);
        assert_eq!(h.session.vm_state(), VmState::Starting);

        h.deliver(Message::new("startup-progress").with("fraction", 0.5));
        h.deliver(Message::new("vm-started").with("check_display", true));
        assert_eq!(h.session.vm_state(), VmState::Running);
        assert_eq!(h.link.sent_types(), vec!["authenticate", "start-vm"]);

        h.deliver(Message::new("vm-stopped"));
        assert_eq!(
            h.link.sent_types(),
            vec!["authenticate", "start-vm", "start-vm"]
        );
        assert_eq!(h.session.vm_state(), VmState::Starting);
    }

    #[test]
    fn running_wanted_while_stopping_waits_for_stop() {
        let mut h = Harness::authenticated("running");
        h.session.want_vm_state(VmState::Stopped);
        h.session.want_vm_state(VmState::Running);
        assert_eq!(h.link.sent_types(), vec!["authenticate", "stop-vm"]);

        h.deliver(Message::new("vm-stopped"));
        assert_eq!(
            h.link.sent_types(),
            vec!["authenticate", "stop-vm", "start-vm"]
        );
    }

    #[test]
    fn destroy_is_sent_once() {
        let mut h = Harness::authenticated("unknown-state");
        assert_eq!(h.session.vm_state(), VmState::Unknown);
        h.session.want_vm_state(VmState::Destroyed);
        h.session.want_vm_state(VmState::Destroyed);
        assert_eq!(h.link.sent_types(), vec!["authenticate", "destroy-vm"]);
        assert_eq!(h.session.vm_state(), VmState::Destroyed);
    }

    #[test]
    fn noop_pairs_send_nothing() {
        let mut h = Harness::authenticated("running");
        h.session.want_vm_state(VmState::Running);
        h.session.want_vm_state(VmState::Unknown);
        h.session.want_vm_state(VmState::Starting);
        assert_eq!(h.link.sent_types(), vec!["authenticate"]);
    }

    #[test]
    fn desired_state_before_auth_is_deferred() {
        let mut h = Harness::new();
        h.session.want_vm_state(VmState::Running);
        assert!(h.link.sent_types().is_empty());

        h.session.handle_transport_event(TransportEvent::Connected);
        h.deliver(Message::new("auth-ok").with("state", "stopped").with("name", "vm1"));
        assert_eq!(h.link.sent_types(), vec!["authenticate", "start-vm"]);
    }

    #[test]
    fn startup_failure_drops_desired_state() {
        let mut h = Harness::authenticated("stopped");
        h.session.want_vm_state(VmState::Running);
        h.deliver(Message::new("startup-failed").with("message", "no disk"));
        h.deliver(Message::new("vm-stopped"));
        assert_eq!(h.link.sent_types(), vec!["authenticate", "start-vm"]);
        assert_eq!(h.session.vm_state(), VmState::Stopped);
    }

    #[test]
    fn unanswered_pings_close_the_connection() {
        let mut h = Harness::authenticated("running");
        for _ in 0..5 {
            h.session.keepalive_tick();
        }
        assert_eq!(h.link.sent_types().iter().filter(|t| *t == "ping").count(), 5);
        assert_eq!(h.link.close_count(), 0);

        h.session.keepalive_tick();
        assert_eq!(h.link.close_count(), 1);
        assert_eq!(h.pump_transport(), Some(CloseReason::Timeout));

        let closes: Vec<Event> = h
            .drain_observed()
            .into_iter()
            .filter(|e| matches!(e, Event::Closed { .. }))
            .collect();
        assert_eq!(
            closes,
            vec![Event::Closed {
                reason: CloseReason::Timeout
            }]
        );
    }

    #[test]
    fn pong_resets_outstanding_pings() {
        let mut h = Harness::authenticated("running");
        for _ in 0..4 {
            h.session.keepalive_tick();
        }
        h.deliver(Message::new("pong"));
        assert_eq!(h.session.outstanding_pings, 0);
        for _ in 0..5 {
            h.session.keepalive_tick();
        }
        assert_eq!(h.link.close_count(), 0);
        assert_eq!(h.link.sent_types().iter().filter(|t| *t == "ping").count(), 9);
    }

    #[test]
    fn no_pings_before_authentication() {
        let mut h = Harness::new();
        h.session.handle_transport_event(TransportEvent::Connected);
        h.session.keepalive_tick();
        assert_eq!(h.link.sent_types(), vec!["authenticate"]);
    }

    #[test]
    fn unknown_message_closes_with_protocol_error() {
        let mut h = Harness::authenticated("running");
        assert_eq!(h.deliver(Message::new("frobnicate")), None);
        assert_eq!(h.link.close_count(), 1);
        match h.pump_transport() {
            Some(CloseReason::Protocol(e)) => assert!(e.contains("frobnicate")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn out_of_state_message_closes() {
        let mut h = Harness::new();
        h.session.handle_transport_event(TransportEvent::Connected);
        h.deliver(Message::new("vm-started").with("check_display", false));
        assert_eq!(h.link.close_count(), 1);
        assert!(matches!(
            h.pump_transport(),
            Some(CloseReason::Protocol(_))
        ));
    }

    #[test]
    fn peer_error_and_auth_failure_close() {
        let mut h = Harness::authenticated("running");
        h.deliver(Message::new("error").with("message", "shutting down"));
        assert_eq!(
            h.pump_transport(),
            Some(CloseReason::Protocol("shutting down".into()))
        );

        let mut h = Harness::new();
        h.session.handle_transport_event(TransportEvent::Connected);
        h.deliver(Message::new("auth-failed").with("error", "bad token"));
        assert_eq!(
            h.pump_transport(),
            Some(CloseReason::AuthFailed("bad token".into()))
        );
    }

    #[test]
    fn transport_close_reason_is_kept_when_not_closing() {
        let mut h = Harness::authenticated("running");
        let reason = h
            .session
            .handle_transport_event(TransportEvent::Closed(CloseReason::PeerClosed));
        assert_eq!(reason, Some(CloseReason::PeerClosed));
        assert_eq!(
            h.drain_observed(),
            vec![Event::Closed {
                reason: CloseReason::PeerClosed
            }]
        );
    }

    #[tokio::test]
    async fn run_loop_times_out_silent_peer() {
        let keepalive = KeepaliveConfig {
            interval: Duration::from_millis(10),
            max_outstanding: 2,
        };
        let (emitter, events) = channel();
        let link = RecordingLink::with_events(emitter.clone());
        let mut session = Session::new(link.clone(), events, "tok", keepalive);
        let mut observed = session.subscribe();

        emitter.emit(TransportEvent::Connected);
        emitter.emit(TransportEvent::Message(
            Message::new("auth-ok").with("state", "running").with("name", "vm1"),
        ));

        let reason = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::Timeout);
        assert_eq!(link.sent_types(), vec!["authenticate", "ping", "ping"]);
        assert_eq!(link.close_count(), 1);

        let mut closes = 0;
        while let Some(event) = observed.try_recv() {
            if matches!(event, Event::Closed { .. }) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn handle_drives_a_running_session() {
        let (emitter, events) = channel();
        let link = RecordingLink::with_events(emitter.clone());
        let session = Session::new(link.clone(), events, "tok", KeepaliveConfig::default());
        let handle = session.handle();

        emitter.emit(TransportEvent::Connected);
        emitter.emit(TransportEvent::Message(
            Message::new("auth-ok").with("state", "stopped").with("name", "vm1"),
        ));
        handle.want_vm_state(VmState::Running).unwrap();
        handle.close();

        let reason = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::Local);
        assert_eq!(link.sent_types(), vec!["authenticate", "start-vm"]);
        assert!(handle.want_vm_state(VmState::Stopped).is_err());
    }
}
