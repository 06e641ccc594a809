//! Property-based tests for admission and priority ordering
//!
//! These verify the queue bound, eviction order and priority monotonicity
//! for arbitrary submission sequences.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use gilgate_core::priority::{PriorityInputs, RateLimitKey};
use gilgate_core::scheduler::{Admission, Take};
use gilgate_core::{AdmissionQueue, Job, PriorityCalculator, RequestBody, RequestInfo};
use http::{HeaderMap, HeaderValue, Method, header};
use proptest::prelude::*;
use uuid::Uuid;

fn job(path: &str) -> Arc<Job> {
    let request = RequestInfo::new(
        Method::GET,
        path.parse().unwrap(),
        HeaderMap::new(),
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
    );
    Job::new(request, RequestBody::empty()).0
}

/// Fixed load inputs for the priority calculator
#[derive(Debug, Clone, Copy)]
struct Load {
    cpu_ms: Option<u64>,
    active: usize,
    rate: f64,
}

impl PriorityInputs for Load {
    fn page_cpu_time(&self, _logical_key: &str) -> Option<u64> {
        self.cpu_ms
    }

    fn active_executions(&self, _key: &RateLimitKey) -> usize {
        self.active
    }

    fn aged_rate(&self, _key: &RateLimitKey) -> f64 {
        self.rate
    }
}

fn load_strategy() -> impl Strategy<Value = Load> {
    (
        prop::option::of(0u64..5_000),
        0usize..4,
        0.0f64..20.0,
    )
        .prop_map(|(cpu_ms, active, rate)| Load {
            cpu_ms,
            active,
            rate,
        })
}

proptest! {
    /// Property: the queue never exceeds its bound and always evicts a
    /// lowest-priority job
    #[test]
    fn prop_overflow_evicts_lowest_priority(
        max_length in 1usize..8,
        priorities in prop::collection::vec(-20i64..20, 1..40)
    ) {
        let queue = AdmissionQueue::new(max_length);
        let mut scores: HashMap<Uuid, i64> = HashMap::new();

        let mut queued: Vec<Arc<Job>> = Vec::new();
        for priority in priorities {
            let job = job("/");
            scores.insert(job.id(), priority);
            queued.push(Arc::clone(&job));

            match queue.push(job, |j: &Job| scores.get(&j.id()).copied().unwrap_or(0)) {
                Admission::Queued => {}
                Admission::Evicted(evicted) => {
                    queued.retain(|j| j.id() != evicted.id());
                    let evicted_priority = scores[&evicted.id()];
                    for remaining in &queued {
                        prop_assert!(scores[&remaining.id()] >= evicted_priority);
                    }
                }
            }
            prop_assert!(queue.len() <= max_length);
            prop_assert_eq!(queue.len(), queued.len());
        }
    }

    /// Property: jobs are taken in non-increasing priority order, ties in
    /// submission order
    #[test]
    fn prop_take_order(priorities in prop::collection::vec(-5i64..5, 0..30)) {
        let queue = AdmissionQueue::new(64);
        let mut scores: HashMap<Uuid, i64> = HashMap::new();
        let mut order: HashMap<Uuid, usize> = HashMap::new();

        for (index, priority) in priorities.iter().enumerate() {
            let job = job("/");
            scores.insert(job.id(), *priority);
            order.insert(job.id(), index);
            let admitted = queue.push(job, |j: &Job| scores.get(&j.id()).copied().unwrap_or(0));
            prop_assert!(matches!(admitted, Admission::Queued));
        }

        let mut previous: Option<(i64, usize)> = None;
        loop {
            let taken = queue.take_highest(|j| scores[&j.id()], |_| false);
            let job = match taken {
                Take::Job(job) => job,
                Take::Empty => break,
                Take::Deferred => unreachable!("nothing is deferred"),
            };
            let current = (scores[&job.id()], order[&job.id()]);
            if let Some((priority, index)) = previous {
                prop_assert!(current.0 <= priority);
                if current.0 == priority {
                    prop_assert!(current.1 > index);
                }
            }
            previous = Some(current);
        }
        prop_assert!(queue.is_empty());
    }

    /// Property: a query string or a bot user agent never raises priority
    #[test]
    fn prop_penalties_never_raise_priority(load in load_strategy()) {
        let calculator = PriorityCalculator::default();
        let plain = job("/page");
        let base = calculator.priority(plain.request(), &load);

        let with_query = job("/page?sort=desc");
        prop_assert!(calculator.priority(with_query.request(), &load) <= base);

        let mut bot = plain.request().clone();
        bot.headers
            .insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (compatible; Googlebot/2.1)"));
        prop_assert!(calculator.priority(&bot, &load) < base);
    }

    /// Property: more concurrent executions from the same source never
    /// raise priority
    #[test]
    fn prop_active_executions_lower_priority(load in load_strategy()) {
        let calculator = PriorityCalculator::default();
        let request = job("/page");
        let busier = Load {
            active: load.active + 1,
            ..load
        };
        prop_assert!(
            calculator.priority(request.request(), &busier)
                < calculator.priority(request.request(), &load)
        );
    }
}
