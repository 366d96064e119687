//! Retry backoff shared by the agent loop (§4.9 step 5 / §7): "no
//! unbounded retry loops exist anywhere." The provider calls themselves
//! go through the CLI session backend (`llm::session`), not a direct
//! HTTP adapter per provider — there is one transport, not one per
//! vendor.

use std::time::Duration;

use rand::Rng;

pub(crate) async fn backoff_sleep(attempt: u32) {
    let base_ms = 200u64 * 2u64.pow(attempt);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..=base_ms / 2);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn backoff_grows_with_attempt_number() {
        let start = Instant::now();
        backoff_sleep(0).await;
        let short = start.elapsed();

        let start = Instant::now();
        backoff_sleep(3).await;
        let long = start.elapsed();

        assert!(long > short);
    }
}
