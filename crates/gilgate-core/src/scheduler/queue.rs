//! Pending job list with overflow eviction.

use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::job::Job;

/// Result of pushing a job onto the queue
#[derive(Debug)]
pub enum Admission {
    Queued,
    /// The queue overflowed and this job, possibly the one just pushed, was removed.
    Evicted(Arc<Job>),
}

/// Result of asking the queue for the next job to run
#[derive(Debug)]
pub enum Take {
    Empty,
    /// The best job is too low priority to run while others are executing.
    Deferred,
    Job(Arc<Job>),
}

/// The shared pending-job list.
///
/// Scans call `score` for every queued job and store the result on the job,
/// so priorities always reflect the state at scan time.
#[derive(Debug)]
pub struct AdmissionQueue {
    jobs: Mutex<Vec<Arc<Job>>>,
    max_length: usize,
}

impl AdmissionQueue {
    pub fn new(max_length: usize) -> Self {
        Self {
            jobs: Mutex::new(Vec::with_capacity(max_length + 1)),
            max_length,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Append a job, evicting the lowest-priority job if the queue overflows.
    pub fn push(&self, job: Arc<Job>, score: impl Fn(&Job) -> i64) -> Admission {
        let mut jobs = self.lock();
        jobs.push(job);
        if jobs.len() <= self.max_length {
            return Admission::Queued;
        }
        match lowest_index(&jobs, &score) {
            Some(index) => Admission::Evicted(jobs.remove(index)),
            None => Admission::Queued,
        }
    }

    /// Remove and return the highest-priority job unless it must be deferred.
    pub fn take_highest(
        &self,
        score: impl Fn(&Job) -> i64,
        is_deferred: impl Fn(i64) -> bool,
    ) -> Take {
        let mut jobs = self.lock();
        let Some(index) = highest_index(&jobs, &score) else {
            return Take::Empty;
        };
        if is_deferred(jobs[index].priority()) {
            return Take::Deferred;
        }
        Take::Job(jobs.remove(index))
    }

    /// Remove a job by id. Returns `false` if it was no longer queued.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut jobs = self.lock();
        match jobs.iter().position(|job| job.id() == id) {
            Some(index) => {
                jobs.remove(index);
                true
            }
            None => false,
        }
    }

    /// Current highest-priority job without removing it
    pub fn highest_priority(&self, score: impl Fn(&Job) -> i64) -> Option<Arc<Job>> {
        let jobs = self.lock();
        highest_index(&jobs, &score).map(|index| Arc::clone(&jobs[index]))
    }

    /// Current lowest-priority job without removing it
    pub fn lowest_priority(&self, score: impl Fn(&Job) -> i64) -> Option<Arc<Job>> {
        let jobs = self.lock();
        lowest_index(&jobs, &score).map(|index| Arc::clone(&jobs[index]))
    }
}

fn rescore(jobs: &[Arc<Job>], score: &impl Fn(&Job) -> i64) {
    for job in jobs {
        job.set_priority(score(job));
    }
}

// Ties resolve to the earliest queued job in both scans.

fn highest_index(jobs: &[Arc<Job>], score: &impl Fn(&Job) -> i64) -> Option<usize> {
    rescore(jobs, score);
    let mut best: Option<(usize, i64)> = None;
    for (index, job) in jobs.iter().enumerate() {
        let priority = job.priority();
        if best.is_none_or(|(_, p)| priority > p) {
            best = Some((index, priority));
        }
    }
    best.map(|(index, _)| index)
}

fn lowest_index(jobs: &[Arc<Job>], score: &impl Fn(&Job) -> i64) -> Option<usize> {
    rescore(jobs, score);
    let mut worst: Option<(usize, i64)> = None;
    for (index, job) in jobs.iter().enumerate() {
        let priority = job.priority();
        if worst.is_none_or(|(_, p)| priority < p) {
            worst = Some((index, priority));
        }
    }
    worst.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_support::job;

    /// Scores jobs by the numeric suffix of their path, e.g. `/p/-50` scores -50.
    fn by_path(job: &Job) -> i64 {
        job.request()
            .uri
            .path()
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    #[test]
    fn test_push_within_capacity() {
        let queue = AdmissionQueue::new(2);
        let (a, _ca) = job("/p/1");
        let (b, _cb) = job("/p/2");
        assert!(matches!(queue.push(a, by_path), Admission::Queued));
        assert!(matches!(queue.push(b, by_path), Admission::Queued));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_overflow_evicts_lowest() {
        let queue = AdmissionQueue::new(2);
        let (a, _ca) = job("/p/10");
        let (b, _cb) = job("/p/-50");
        let (c, _cc) = job("/p/5");
        queue.push(a, by_path);
        queue.push(b.clone(), by_path);

        match queue.push(c, by_path) {
            Admission::Evicted(evicted) => assert_eq!(evicted.id(), b.id()),
            Admission::Queued => panic!("expected eviction"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_overflow_can_evict_new_job() {
        let queue = AdmissionQueue::new(1);
        let (a, _ca) = job("/p/10");
        let (b, _cb) = job("/p/-10");
        queue.push(a, by_path);
        match queue.push(b.clone(), by_path) {
            Admission::Evicted(evicted) => assert_eq!(evicted.id(), b.id()),
            Admission::Queued => panic!("expected eviction"),
        }
    }

    #[test]
    fn test_take_highest_recomputes() {
        let queue = AdmissionQueue::new(8);
        let (a, _ca) = job("/p/1");
        let (b, _cb) = job("/p/2");
        queue.push(a.clone(), by_path);
        queue.push(b.clone(), by_path);

        // A scoring function that inverts the order wins over stale priorities
        let inverted = |job: &Job| -by_path(job);
        match queue.take_highest(inverted, |_| false) {
            Take::Job(taken) => assert_eq!(taken.id(), a.id()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.priority(), -1);
    }

    #[test]
    fn test_take_highest_deferred_and_empty() {
        let queue = AdmissionQueue::new(8);
        assert!(matches!(queue.take_highest(by_path, |_| false), Take::Empty));

        let (a, _ca) = job("/p/-9000");
        queue.push(a, by_path);
        assert!(matches!(
            queue.take_highest(by_path, |p| p <= -7000),
            Take::Deferred
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ties_prefer_earliest() {
        let queue = AdmissionQueue::new(8);
        let (a, _ca) = job("/p/0");
        let (b, _cb) = job("/p/0");
        queue.push(a.clone(), by_path);
        queue.push(b, by_path);
        assert_eq!(queue.highest_priority(by_path).unwrap().id(), a.id());
        assert_eq!(queue.lowest_priority(by_path).unwrap().id(), a.id());
    }

    #[test]
    fn test_remove() {
        let queue = AdmissionQueue::new(8);
        let (a, _ca) = job("/p/0");
        queue.push(a.clone(), by_path);
        assert!(queue.remove(a.id()));
        assert!(!queue.remove(a.id()));
        assert!(queue.is_empty());
    }
}
