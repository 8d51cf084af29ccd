//! Scenario: a nursery with three concurrent children, all of which
//! complete normally. The nursery body does not return until every child
//! has terminated (§3 "Nursery").

use std::cell::Cell;
use std::rc::Rc;

use kestrel_runtime::{checkpoint, current_task, open_nursery, run, RuntimeConfig, TaskError};

#[test]
fn nursery_waits_for_all_three_children() {
    let result = run(RuntimeConfig::new(), || async {
        let completed = Rc::new(Cell::new(0u32));
        let ids = Rc::new(std::cell::RefCell::new(Vec::new()));

        open_nursery(|nursery| {
            let completed = completed.clone();
            let ids = ids.clone();
            async move {
                for _ in 0..3 {
                    let completed = completed.clone();
                    let ids = ids.clone();
                    nursery.start_soon(move || async move {
                        checkpoint().await?;
                        ids.borrow_mut().push(current_task().id());
                        completed.set(completed.get() + 1);
                        Ok(())
                    });
                }
                Ok::<(), TaskError>(())
            }
        })
        .await?;

        assert_eq!(completed.get(), 3);
        let recorded = ids.borrow();
        assert_eq!(recorded.len(), 3);
        let mut unique = recorded.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3, "each child must have a distinct task id");

        Ok::<(), TaskError>(())
    });

    assert!(result.is_ok());
}
