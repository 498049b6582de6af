//! Admission and lifecycle tests driven through the scheduler
//!
//! These tests exercise the login queue, duplicate logins, reconnect grace
//! and session teardown the way a running server does: sessions arrive
//! through the intake and everything else happens on world ticks.

use server::connection::{RecordingConnection, RecordingHandle};
use server::hooks::WorldContext;
use server::opcode::{default_catalog, opcodes};
use server::rate_limit::RateLimitPolicy;
use server::registry::SessionRegistry;
use server::scheduler::{LinkRequest, Scheduler};
use server::session::{PacketSink, Session, LOGOUT_DELAY_MS};
use shared::{ConnectionChannel, PacketEnvelope, ServerNotice};
use std::sync::Arc;
use std::time::Duration;

fn make_scheduler(player_limit: usize) -> Scheduler {
    let ctx = WorldContext::new(Arc::new(default_catalog()), RateLimitPolicy::Log);
    Scheduler::new(SessionRegistry::new(player_limit), ctx)
}

fn make_session(account_id: u32) -> (Session, RecordingHandle, PacketSink) {
    let connection = RecordingConnection::new();
    let handle = connection.handle();
    let session = Session::new(account_id, Box::new(connection));
    let sink = session.packet_sink();
    (session, handle, sink)
}

fn envelope(opcode: u16, payload: Vec<u8>) -> PacketEnvelope {
    PacketEnvelope::new(opcode, ConnectionChannel::Primary, payload)
}

/// LOGIN QUEUE TESTS
mod queue_tests {
    use super::*;

    /// Four logins against two slots: the first two are served, the rest
    /// queue in arrival order. When a served session leaves, the queue
    /// front is promoted and everyone behind is re-notified.
    #[test]
    fn fifo_queue_promotes_in_arrival_order() {
        let mut scheduler = make_scheduler(2);
        let intake = scheduler.session_intake();

        let (a, a_handle, _) = make_session(1);
        let (b, b_handle, _) = make_session(2);
        let (c, c_handle, _) = make_session(3);
        let (d, d_handle, _) = make_session(4);
        intake.submit(a);
        intake.submit(b);
        intake.submit(c);
        intake.submit(d);
        scheduler.tick(50);

        assert_eq!(scheduler.registry().active_count(), 2);
        assert_eq!(scheduler.registry().queued_count(), 2);
        assert_eq!(a_handle.last_notice(), Some(ServerNotice::LoginProceed));
        assert_eq!(
            c_handle.last_notice(),
            Some(ServerNotice::QueuePosition { position: 1 })
        );
        assert_eq!(
            d_handle.last_notice(),
            Some(ServerNotice::QueuePosition { position: 2 })
        );

        // B drops its connection; the next tick reaps it and promotes C.
        b_handle.sever();
        scheduler.tick(50);

        assert_eq!(scheduler.registry().active_count(), 2);
        assert_eq!(scheduler.registry().queued_count(), 1);
        assert_eq!(c_handle.last_notice(), Some(ServerNotice::LoginProceed));
        assert_eq!(
            d_handle.last_notice(),
            Some(ServerNotice::QueuePosition { position: 1 })
        );
    }

    /// A queued session abandoning the wait frees no serving slot; the
    /// sessions behind it only move up in the queue.
    #[test]
    fn abandoned_queue_slot_activates_nobody() {
        let mut scheduler = make_scheduler(1);
        let intake = scheduler.session_intake();

        let (a, _, _) = make_session(1);
        let (b, b_handle, _) = make_session(2);
        let (c, c_handle, _) = make_session(3);
        intake.submit(a);
        intake.submit(b);
        intake.submit(c);
        scheduler.tick(50);
        assert_eq!(scheduler.registry().queued_count(), 2);

        b_handle.sever();
        scheduler.tick(50);

        assert_eq!(scheduler.registry().active_count(), 1);
        assert_eq!(scheduler.registry().queued_count(), 1);
        assert_eq!(
            c_handle.last_notice(),
            Some(ServerNotice::QueuePosition { position: 1 })
        );
    }

    /// Queued sessions may not act before admission: their packets are
    /// consumed as violations, never dispatched and never replayed.
    #[test]
    fn queued_session_cannot_dispatch() {
        let mut scheduler = make_scheduler(1);
        let intake = scheduler.session_intake();

        let (a, _, _) = make_session(1);
        let (b, b_handle, b_sink) = make_session(2);
        intake.submit(a);
        intake.submit(b);
        scheduler.tick(50);
        assert!(scheduler.registry().get(2).unwrap().is_queued());

        b_sink.queue_packet(envelope(
            opcodes::CMSG_PLAYER_LOGIN,
            9001u64.to_le_bytes().to_vec(),
        ));
        scheduler.tick(50);

        let queued = scheduler.registry().get(2).unwrap();
        assert!(queued.player().is_none());
        assert_eq!(queued.queued_len(), 0);
        assert!(b_handle.is_open());
    }

    /// A capacity-bypass session is served past the player limit instead
    /// of queuing.
    #[test]
    fn capacity_bypass_is_served_at_capacity() {
        let mut scheduler = make_scheduler(1);
        let intake = scheduler.session_intake();

        let (a, _, _) = make_session(1);
        let (mut vip, vip_handle, _) = make_session(2);
        vip.set_capacity_bypass(true);
        intake.submit(a);
        intake.submit(vip);
        scheduler.tick(50);

        assert_eq!(scheduler.registry().active_count(), 2);
        assert_eq!(vip_handle.last_notice(), Some(ServerNotice::LoginProceed));
    }
}

/// DUPLICATE LOGIN TESTS
mod duplicate_login_tests {
    use super::*;

    /// A second login for the same account evicts the first session with a
    /// disconnect notice; the account never holds two slots.
    #[test]
    fn second_login_evicts_first_session() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();

        let (first, first_handle, _) = make_session(7);
        intake.submit(first);
        scheduler.tick(50);

        let (second, second_handle, _) = make_session(7);
        intake.submit(second);
        scheduler.tick(50);

        assert_eq!(scheduler.registry().session_count(), 1);
        assert!(!first_handle.is_open());
        assert!(matches!(
            first_handle.last_notice(),
            Some(ServerNotice::Disconnected { .. })
        ));
        assert!(second_handle.is_open());
    }

    /// Eviction saves the in-world player before the replacement session
    /// is installed.
    #[test]
    fn eviction_logs_out_the_old_player() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();

        let (first, _, first_sink) = make_session(7);
        intake.submit(first);
        scheduler.tick(50);

        first_sink.queue_packet(envelope(
            opcodes::CMSG_PLAYER_LOGIN,
            9001u64.to_le_bytes().to_vec(),
        ));
        scheduler.tick(50);
        assert!(scheduler.registry().get(7).unwrap().player().is_some());

        let (second, second_handle, _) = make_session(7);
        intake.submit(second);
        scheduler.tick(50);

        // The surviving session is the fresh one, with no entity bound.
        let session = scheduler.registry().get(7).unwrap();
        assert!(session.player().is_none());
        assert!(second_handle.is_open());
    }
}

/// RECONNECT GRACE TESTS
mod reconnect_tests {
    use super::*;

    /// A player dropped moments ago reconnects past a full server without
    /// queuing.
    #[test]
    fn recent_disconnect_bypasses_queue() {
        let mut scheduler = make_scheduler(1);
        let intake = scheduler.session_intake();

        let (a, a_handle, _) = make_session(1);
        intake.submit(a);
        scheduler.tick(50);

        a_handle.sever();
        scheduler.tick(50);
        assert_eq!(scheduler.registry().session_count(), 0);

        // Someone else takes the only slot in the meantime.
        let (b, _, _) = make_session(2);
        intake.submit(b);
        scheduler.tick(50);

        let (back, back_handle, _) = make_session(1);
        intake.submit(back);
        scheduler.tick(50);

        assert_eq!(back_handle.last_notice(), Some(ServerNotice::LoginProceed));
        assert_eq!(scheduler.registry().queued_count(), 0);
    }

    /// Once the grace window has lapsed the returning account queues like
    /// anyone else.
    #[test]
    fn expired_grace_queues_normally() {
        let mut scheduler = make_scheduler(1);
        scheduler.registry_mut().set_reconnect_grace(Duration::from_millis(0));
        let intake = scheduler.session_intake();

        let (a, a_handle, _) = make_session(1);
        intake.submit(a);
        scheduler.tick(50);
        a_handle.sever();
        scheduler.tick(50);

        let (b, _, _) = make_session(2);
        intake.submit(b);
        scheduler.tick(50);

        let (back, back_handle, _) = make_session(1);
        intake.submit(back);
        scheduler.tick(50);

        assert_eq!(
            back_handle.last_notice(),
            Some(ServerNotice::QueuePosition { position: 1 })
        );
    }
}

/// SESSION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// End-to-end journey: admitted, logged in, transferred into the world,
    /// delayed logout fires after its full delay, session survives as
    /// recently-logged-out and is finally reaped when the socket dies.
    #[test]
    fn full_session_lifecycle() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();

        let (session, handle, sink) = make_session(1);
        intake.submit(session);
        scheduler.tick(50);

        sink.queue_packet(envelope(
            opcodes::CMSG_PLAYER_LOGIN,
            9001u64.to_le_bytes().to_vec(),
        ));
        sink.queue_packet(envelope(opcodes::CMSG_TRANSFER_ACK, Vec::new()));
        scheduler.tick(50);
        assert!(scheduler.registry().get(1).unwrap().player_in_world());

        sink.queue_packet(envelope(opcodes::CMSG_LOGOUT_REQUEST, Vec::new()));
        scheduler.tick(50);
        assert!(scheduler.registry().get(1).unwrap().is_logging_out());

        // Half the delay: still in the world.
        scheduler.tick(LOGOUT_DELAY_MS / 2);
        assert!(scheduler.registry().get(1).unwrap().player().is_some());

        scheduler.tick(LOGOUT_DELAY_MS / 2 + 50);
        let session = scheduler.registry().get(1).unwrap();
        assert!(session.player().is_none());
        assert!(session.recently_logged_out());
        assert!(handle.is_open());

        handle.sever();
        scheduler.tick(50);
        assert_eq!(scheduler.registry().session_count(), 0);
    }

    /// A dead socket with a player still bound is kept long enough for the
    /// immediate logout to save the player, then reaped.
    #[test]
    fn dead_socket_saves_player_before_reap() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();

        let (session, handle, sink) = make_session(1);
        intake.submit(session);
        scheduler.tick(50);

        sink.queue_packet(envelope(
            opcodes::CMSG_PLAYER_LOGIN,
            9001u64.to_le_bytes().to_vec(),
        ));
        sink.queue_packet(envelope(opcodes::CMSG_TRANSFER_ACK, Vec::new()));
        scheduler.tick(50);

        handle.sever();
        scheduler.tick(50);
        // Retained: the logout is in flight.
        assert_eq!(scheduler.registry().session_count(), 1);

        scheduler.tick(50);
        assert_eq!(scheduler.registry().session_count(), 0);
    }

    /// A forced exit skips every grace period: the session is gone on the
    /// next tick with its connection closed.
    #[test]
    fn force_exit_skips_teardown_grace() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();

        let (session, handle, sink) = make_session(1);
        intake.submit(session);
        scheduler.tick(50);

        sink.queue_packet(envelope(
            opcodes::CMSG_PLAYER_LOGIN,
            9001u64.to_le_bytes().to_vec(),
        ));
        scheduler.tick(50);

        scheduler.registry_mut().get_mut(1).unwrap().force_exit();
        scheduler.tick(50);

        assert_eq!(scheduler.registry().session_count(), 0);
        assert!(!handle.is_open());
    }
}

/// TICK LOOP TESTS
mod tick_loop_tests {
    use super::*;

    /// The real async tick loop picks up intake submissions on its own.
    #[tokio::test]
    async fn run_loop_admits_intake() {
        let scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();

        let (session, handle, _) = make_session(1);
        let task = tokio::spawn(scheduler.run(Duration::from_millis(10)));

        intake.submit(session);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(handle.last_notice(), Some(ServerNotice::LoginProceed));
        task.abort();
    }
}

/// SECONDARY LINK TESTS
mod link_tests {
    use super::*;

    /// The full secondary-channel handshake: token issued, link request
    /// arrives, next tick attaches it to the owning session.
    #[test]
    fn link_handshake_attaches_secondary_channel() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();
        let links = scheduler.link_intake();

        let (session, _, _) = make_session(1);
        intake.submit(session);
        scheduler.tick(50);

        let token = scheduler.issue_link_token(1);
        links.submit(LinkRequest {
            token,
            connection: Box::new(RecordingConnection::new()),
        });
        scheduler.tick(50);

        assert!(scheduler.registry().get(1).unwrap().has_secondary());
    }

    /// An expired token must not attach anything; the orphan connection is
    /// closed instead.
    #[test]
    fn expired_token_closes_orphan_connection() {
        let mut scheduler = make_scheduler(10);
        let intake = scheduler.session_intake();
        let links = scheduler.link_intake();

        let (session, _, _) = make_session(1);
        intake.submit(session);
        scheduler.tick(50);

        scheduler.set_link_ttl(Duration::from_millis(0));
        let token = scheduler.issue_link_token(1);

        let orphan = RecordingConnection::new();
        let orphan_handle = orphan.handle();
        links.submit(LinkRequest {
            token,
            connection: Box::new(orphan),
        });
        scheduler.tick(50);

        assert!(!scheduler.registry().get(1).unwrap().has_secondary());
        assert!(!orphan_handle.is_open());
    }
}
