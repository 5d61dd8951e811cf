use tracing::trace;

// Trace-level counters; the Prometheus recorder installed in main renders
// whatever the exporter itself tracks.

pub fn inc_requests(route: &'static str) {
    trace!(target = "listings.metrics", route = route, "requests_total_inc");
}

pub fn task_elapsed(task: &'static str, elapsed_ms: u128) {
    trace!(
        target = "listings.metrics",
        task = task,
        elapsed_ms = elapsed_ms as u64,
        "task_elapsed"
    );
}

pub fn job_finished(job: &str, outcome: &'static str, elapsed_ms: u64, attempts: u32) {
    trace!(
        target = "listings.metrics",
        job = job,
        outcome = outcome,
        elapsed_ms,
        attempts,
        "job_finished"
    );
}

pub fn cache_lookup(cache: &'static str, hit: bool) {
    trace!(target = "listings.metrics", cache = cache, hit, "cache_lookup");
}

pub fn views_flushed(listings: usize, views: u64) {
    trace!(target = "listings.metrics", listings, views, "views_flushed");
}
