//! Property-based tests for rollout engine invariants.
//!
//! Random operation sequences against the in-memory store verify that the
//! FSM only moves forward, terminal rollouts stay off the queue, aborts
//! stick, and restart rehydration reproduces the scheduled set exactly.

mod common;

use proptest::prelude::*;
use tokio_test::block_on;
use uuid::Uuid;

use capstan_core::{Change, Clock, RolloutState, RolloutStatus};
use common::{running_instance, Harness};

/// Position of a state on the forward path. Terminal states are handled
/// separately.
fn rank(state: RolloutState) -> Option<u8> {
    match state {
        RolloutState::Pending => Some(0),
        RolloutState::Preparing => Some(1),
        RolloutState::Deploying => Some(2),
        RolloutState::Observing => Some(3),
        RolloutState::Done | RolloutState::Failed | RolloutState::Aborted => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Turn,
    Abort,
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![6 => Just(Step::Turn), 1 => Just(Step::Abort)],
        1..14,
    )
}

#[derive(Debug, Clone, Copy)]
enum Op {
    New,
    Turn,
    Abort,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![2 => Just(Op::New), 5 => Just(Op::Turn), 1 => Just(Op::Abort)],
        1..24,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Invariants 2, 4, 6, and 8: the FSM never moves backward, terminal
    /// states are de-scheduled, the secret referenced by the binding is
    /// live, and an abort is final.
    #[test]
    fn fsm_moves_forward_and_abort_sticks(
        steps in arb_steps(),
        lag in 0usize..3,
        auto in any::<bool>(),
    ) {
        block_on(async move {
            let h = Harness::new();
            h.register_build("b1", "img");

            let mut changes = vec![Change::Replicas(1), Change::BuildId("b1".to_string())];
            if auto {
                changes.push(Change::AutoAddRigServiceAccounts(true));
            }
            let id = h.service.new_rollout(h.capsule.id, changes).await.unwrap();

            // The cluster converges only after `lag` empty observations.
            for _ in 0..lag {
                h.gateway.push_phase(Vec::new());
            }
            h.gateway.push_phase(vec![running_instance("i-0", "b1")]);

            let mut last_rank = rank(h.status(id).state);
            let mut abort_observed = false;

            for step in steps {
                match step {
                    Step::Turn => {
                        let _ = h.turn_after_backoff(id).await;
                    }
                    Step::Abort => {
                        if h.service.abort_rollout(h.capsule.id, id).await.is_ok() {
                            abort_observed = true;
                        }
                    }
                }

                let status = h.status(id);

                if status.state.is_terminal() {
                    assert_eq!(status.scheduled_at, None, "terminal rollout still scheduled");
                } else {
                    let current = rank(status.state).unwrap();
                    if let Some(previous) = last_rank {
                        assert!(
                            current >= previous,
                            "state moved backward: {previous} -> {current}"
                        );
                    }
                    last_rank = Some(current);
                }

                if abort_observed {
                    assert_eq!(status.state, RolloutState::Aborted, "abort did not stick");
                }

                if let Some(credentials) = &status.rig_service_account {
                    let secret_id = Uuid::parse_str(&credentials.client_secret_key).unwrap();
                    assert!(
                        h.store.get_secret(secret_id).is_ok(),
                        "binding references a dead secret"
                    );
                }
            }
        });
    }

    /// Invariant 1: a capsule never has two non-terminated rollouts.
    #[test]
    fn at_most_one_active_rollout(ops in arb_ops()) {
        block_on(async move {
            let h = Harness::new();
            h.register_build("b1", "img");
            h.gateway.push_phase(vec![running_instance("i-0", "b1")]);

            for op in ops {
                let current = h.store.get_capsule(h.capsule.id).unwrap().current_rollout;
                match op {
                    Op::New => {
                        let _ = h
                            .service
                            .new_rollout(
                                h.capsule.id,
                                vec![Change::Replicas(1), Change::BuildId("b1".to_string())],
                            )
                            .await;
                    }
                    Op::Turn if current != 0 => {
                        let _ = h.turn_after_backoff(current).await;
                    }
                    Op::Abort if current != 0 => {
                        let _ = h.service.abort_rollout(h.capsule.id, current).await;
                    }
                    _ => {}
                }

                let capsule = h.store.get_capsule(h.capsule.id).unwrap();
                let mut active = 0;
                for rollout_id in 1..=capsule.current_rollout {
                    let (_, status, _) =
                        h.store.get_rollout_record(h.capsule.id, rollout_id).unwrap();
                    if !status.state.is_terminal() {
                        active += 1;
                    }
                }
                assert!(active <= 1, "{active} rollouts active at once");
            }
        });
    }

    /// Invariant 7: after a restart, the queue holds exactly the rollouts
    /// the repository still has scheduled, at their stored due times.
    #[test]
    fn rehydration_restores_scheduled_jobs(
        specs in prop::collection::vec((any::<bool>(), 0i64..3600), 1..8),
    ) {
        block_on(async move {
            let h = Harness::new();
            let base = h.clock.now();

            let mut scheduled = Vec::new();
            for (on_queue, offset) in &specs {
                let status = RolloutStatus {
                    state: if *on_queue {
                        RolloutState::Observing
                    } else {
                        RolloutState::Done
                    },
                    message: String::new(),
                    updated_at: base,
                    scheduled_at: on_queue.then(|| base + chrono::Duration::seconds(*offset)),
                    rig_service_account: None,
                };
                let id = h
                    .store
                    .create_rollout_record(h.capsule.id, &Default::default(), &status)
                    .unwrap();
                if let Some(due) = status.scheduled_at {
                    scheduled.push((id, due));
                }
            }

            // The harness queue is empty (nothing went through new_rollout),
            // exactly like a freshly restarted process.
            assert!(h.service.queue().is_empty());
            h.service.init_jobs().await.unwrap();

            assert_eq!(h.service.queue().len(), scheduled.len());
            for (rollout_id, due) in scheduled {
                assert_eq!(h.service.queue().due_at(h.capsule.id, rollout_id), Some(due));
            }
        });
    }
}
