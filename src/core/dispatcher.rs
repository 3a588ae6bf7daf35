//! Response dispatcher
//!
//! Rendezvous point between the background line reader (the single producer)
//! and callers that block until a line matching one of their patterns shows
//! up. Each line is consumed by at most one waiter; lines that no waiter wants
//! are dropped.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Maximum number of lines held while no waiter is armed
pub const DEFAULT_BACKLOG_LIMIT: usize = 64;

/// Capture groups of the winning pattern, or `None` on timeout
pub type MatchResult = Option<Vec<String>>;

/// An ordered set of full-line patterns
#[derive(Debug, Clone)]
pub struct PatternSet {
    regexes: Vec<Regex>,
}

impl PatternSet {
    /// Compile `patterns`.
    ///
    /// Each pattern is anchored to the whole line and wrapped in a capture
    /// group, so the first returned group is always the full line.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let regexes = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:({}))$", p.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { regexes })
    }

    /// Match `line` against the patterns in order; the first full match wins
    pub fn captures(&self, line: &str) -> Option<Vec<String>> {
        self.regexes.iter().find_map(|re| {
            re.captures(line).map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                    .collect()
            })
        })
    }

    /// Number of patterns
    pub fn len(&self) -> usize {
        self.regexes.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }
}

struct Waiter {
    id: u64,
    patterns: PatternSet,
    tx: oneshot::Sender<Vec<String>>,
}

struct Registration<'a> {
    dispatcher: &'a ResponseDispatcher,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.dispatcher.inner.lock().waiters.retain(|w| w.id != id);
    }
}

struct Mailbox {
    waiters: Vec<Waiter>,
    backlog: VecDeque<String>,
    next_id: u64,
}

/// Line dispatcher shared between the line reader and protocol waiters
pub struct ResponseDispatcher {
    inner: Mutex<Mailbox>,
    backlog_limit: usize,
}

impl ResponseDispatcher {
    /// Create a dispatcher with the default backlog limit
    pub fn new() -> Self {
        Self::with_backlog_limit(DEFAULT_BACKLOG_LIMIT)
    }

    /// Create a dispatcher holding at most `limit` unclaimed lines
    pub fn with_backlog_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Mailbox {
                waiters: Vec::new(),
                backlog: VecDeque::new(),
                next_id: 0,
            }),
            backlog_limit: limit,
        }
    }

    /// Publish a completed line. Never blocks.
    pub fn push(&self, line: String) {
        let mut mailbox = self.inner.lock();

        if mailbox.waiters.is_empty() {
            if self.backlog_limit == 0 {
                return;
            }
            if mailbox.backlog.len() >= self.backlog_limit {
                let dropped = mailbox.backlog.pop_front();
                tracing::trace!("Backlog full, dropping {:?}", dropped);
            }
            mailbox.backlog.push_back(line);
            return;
        }

        let mut index = 0;
        while index < mailbox.waiters.len() {
            let Some(groups) = mailbox.waiters[index].patterns.captures(&line) else {
                index += 1;
                continue;
            };
            let waiter = mailbox.waiters.remove(index);
            match waiter.tx.send(groups) {
                Ok(()) => return,
                // Receiver gave up between timing out and deregistering; offer
                // the line to the next waiter.
                Err(_) => continue,
            }
        }
        tracing::trace!("Unmatched line dropped: {}", line);
    }

    /// Wait for the first line fully matching one of `patterns`.
    ///
    /// `timeout` bounds the whole wait, not each line. `None` waits forever.
    pub async fn wait_match<S: AsRef<str>>(
        &self,
        patterns: &[S],
        timeout: Option<Duration>,
    ) -> Result<MatchResult, regex::Error> {
        let patterns = PatternSet::compile(patterns)?;
        Ok(self.wait_for(patterns, timeout).await)
    }

    /// Same as [`wait_match`](Self::wait_match) with precompiled patterns
    pub async fn wait_for(&self, patterns: PatternSet, timeout: Option<Duration>) -> MatchResult {
        let deadline = timeout.map(|t| Instant::now() + t);

        let (id, mut rx) = {
            let mut mailbox = self.inner.lock();
            while let Some(line) = mailbox.backlog.pop_front() {
                if let Some(groups) = patterns.captures(&line) {
                    return Some(groups);
                }
                tracing::trace!("Unmatched line dropped: {}", line);
            }

            let (tx, rx) = oneshot::channel();
            let id = mailbox.next_id;
            mailbox.next_id += 1;
            mailbox.waiters.push(Waiter { id, patterns, tx });
            (id, rx)
        };
        // Deregisters on every exit, including when this future is dropped
        let registration = Registration { dispatcher: self, id };

        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(received) => received.ok(),
                Err(_) => None,
            },
            None => (&mut rx).await.ok(),
        };
        if received.is_some() {
            return received;
        }

        // Timed out: deregister, then pick up a match that raced the deadline.
        drop(registration);
        rx.try_recv().ok()
    }

    /// Number of armed waiters
    pub fn pending_waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Number of lines held for the next waiter
    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_full_line_anchoring() {
        let set = PatternSet::compile(&[r"!OK TEST (\d+)"]).unwrap();
        assert_eq!(
            set.captures("!OK TEST 48"),
            Some(vec!["!OK TEST 48".to_string(), "48".to_string()])
        );
        assert_eq!(set.captures("xx !OK TEST 48"), None);
        assert_eq!(set.captures("!OK TEST 48 extra"), None);
    }

    #[test]
    fn test_first_pattern_wins() {
        let set = PatternSet::compile(&[r"(\w+) (\d+)", r"score (\d+)"]).unwrap();
        let groups = set.captures("score 7").unwrap();
        assert_eq!(groups, vec!["score 7", "score", "7"]);
    }

    #[test]
    fn test_alternation_is_anchored_as_a_whole() {
        let set = PatternSet::compile(&["a|ab"]).unwrap();
        assert_eq!(set.captures("ab"), Some(vec!["ab".to_string()]));
    }

    #[test]
    fn test_missing_optional_group_is_empty() {
        let set = PatternSet::compile(&[r"x(\d)?"]).unwrap();
        assert_eq!(set.captures("x"), Some(vec!["x".to_string(), String::new()]));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(PatternSet::compile(&["(unclosed"]).is_err());
    }

    #[tokio::test]
    async fn test_backlog_line_consumed() {
        let dispatcher = ResponseDispatcher::new();
        dispatcher.push("noise".to_string());
        dispatcher.push("!FAIL TEST".to_string());
        dispatcher.push("later".to_string());

        let result = dispatcher
            .wait_match(&[r"!OK TEST (\d+)", "!FAIL TEST"], Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["!FAIL TEST".to_string()]));
        // "noise" was examined and dropped; "later" waits for the next call
        assert_eq!(dispatcher.backlog_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_total_not_per_line() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let producer = dispatcher.clone();

        tokio::spawn(async move {
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(300)).await;
                producer.push("noise".to_string());
            }
        });

        let start = Instant::now();
        let result = dispatcher
            .wait_match(&["never"], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(result, None);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));
        assert_eq!(dispatcher.pending_waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_to_waiter() {
        let dispatcher = Arc::new(ResponseDispatcher::new());
        let producer = dispatcher.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push("!DATA_ACK 3".to_string());
            producer.push("!DATA_ACK 48".to_string());
        });

        let result = dispatcher
            .wait_match(&[r"!DATA_ACK (\d+)"], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["!DATA_ACK 3".to_string(), "3".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_first_match_wins() {
        let dispatcher = Arc::new(ResponseDispatcher::new());

        let digits = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.wait_match(&[r"\d+"], Some(Duration::from_secs(1))).await })
        };
        let words = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.wait_match(&[r"[a-z]+"], Some(Duration::from_secs(1))).await })
        };

        while dispatcher.pending_waiters() < 2 {
            tokio::task::yield_now().await;
        }
        dispatcher.push("hello".to_string());
        dispatcher.push("42".to_string());

        assert_eq!(digits.await.unwrap().unwrap(), Some(vec!["42".to_string()]));
        assert_eq!(words.await.unwrap().unwrap(), Some(vec!["hello".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_deregisters() {
        let dispatcher = ResponseDispatcher::new();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), dispatcher.wait_match(&["never"], None)).await;
        assert!(cancelled.is_err());
        assert_eq!(dispatcher.pending_waiters(), 0);

        dispatcher.push("!OK TEST 48".to_string());
        assert_eq!(dispatcher.backlog_len(), 1);

        let result = dispatcher
            .wait_match(&[r"!OK TEST (\d+)"], Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["!OK TEST 48".to_string(), "48".to_string()]));
    }

    #[tokio::test]
    async fn test_backlog_limit_drops_oldest() {
        let dispatcher = ResponseDispatcher::with_backlog_limit(2);
        dispatcher.push("one".to_string());
        dispatcher.push("two".to_string());
        dispatcher.push("three".to_string());
        assert_eq!(dispatcher.backlog_len(), 2);

        let result = dispatcher
            .wait_match(&["one", "two"], Some(Duration::from_millis(1)))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["two".to_string()]));
    }
}
