use std::collections::HashMap;

use rand::seq::SliceRandom;

/// Produces the queue order consulted on each poll tick.
///
/// Strict mode replays the weight-expanded declaration order every time.
/// Otherwise the list is either stably sorted by priority (lowest first,
/// missing and negative entries count as 0) or uniformly shuffled.
#[derive(Debug, Clone)]
pub(crate) struct QueueSelector {
    queues: Vec<String>,
    strict: bool,
    priorities: HashMap<String, i32>,
}

impl QueueSelector {
    pub(crate) fn new(
        queues: Vec<String>,
        strict: bool,
        priorities: HashMap<String, i32>,
    ) -> QueueSelector {
        QueueSelector {
            queues,
            strict,
            priorities,
        }
    }

    pub(crate) fn queues(&self) -> &[String] {
        self.queues.as_slice()
    }

    pub(crate) fn order(&self) -> Vec<String> {
        let mut queues = self.queues.clone();

        if self.strict {
            return queues;
        }

        if self.priorities.is_empty() {
            queues.shuffle(&mut rand::thread_rng());
        } else {
            let priorities = &self.priorities;
            queues.sort_by_key(|name| priorities.get(name).copied().unwrap_or(0).max(0));
        }

        queues
    }
}
