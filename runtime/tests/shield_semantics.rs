//! Scenario: a shielded inner scope is immune to an outer cancellation
//! while the shield is up, and observes it immediately once the shield is
//! lifted (§4.C "stopping at the first shield").

use kestrel_runtime::{checkpoint_if_cancelled, open_cancel_scope, run, RuntimeConfig, TaskError};

#[test]
fn shield_blocks_outer_cancellation_until_lifted() {
    let result = run(RuntimeConfig::new(), || async {
        let outer = open_cancel_scope();
        let outcome = outer
            .run(|outer_handle| async move {
                outer_handle.cancel();

                let inner = open_cancel_scope().shield(true);
                let inner_outcome = inner
                    .run(|inner_handle| async move {
                        // The outer cancellation is already pending, but
                        // the shield stops the walk before it reaches us.
                        let seen_while_shielded = checkpoint_if_cancelled().is_err();

                        inner_handle.set_shield(false);

                        // Same outer cancellation, shield now down: must
                        // be visible immediately, with no new checkpoint
                        // needed to notice it.
                        let seen_after_unshielding = checkpoint_if_cancelled().is_err();

                        Ok::<(bool, bool), TaskError>((
                            seen_while_shielded,
                            seen_after_unshielding,
                        ))
                    })
                    .await?;

                Ok::<(bool, bool), TaskError>(inner_outcome.value.unwrap())
            })
            .await?;

        Ok::<(bool, bool), TaskError>(outcome.value.unwrap())
    });

    let (seen_while_shielded, seen_after_unshielding) = result.unwrap();
    assert!(!seen_while_shielded, "shield must block an outer cancellation");
    assert!(seen_after_unshielding, "lifting the shield must expose the pending cancellation");
}
