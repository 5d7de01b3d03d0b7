//! Key layout in the coordination store.

pub const PENDING: &str = "q:pending";
pub const DONE: &str = "q:done";
pub const REJECTED: &str = "q:rejected";
pub const SLOTS: &str = "slots:available";
pub const CAP_PREFIX: &str = "cap:";
pub const PUSHED_PREFIX: &str = "pushed:";

pub fn node_queue(node: &str) -> String {
    format!("q:{}", node)
}

pub fn cap(node: &str) -> String {
    format!("{}{}", CAP_PREFIX, node)
}

pub fn cap_total(node: &str) -> String {
    format!("cap_total:{}", node)
}

pub fn run_count(node: &str) -> String {
    format!("run_count:{}", node)
}

pub fn slots_total(node: &str) -> String {
    format!("slots_total:{}", node)
}

/// Marker recording that `id` was already pushed onto `list`.
pub fn push_marker(list: &str, id: &str) -> String {
    format!("{}{}:{}", PUSHED_PREFIX, list, id)
}

/// Node id from a `cap:<node>` key.
pub fn node_from_cap_key(key: &str) -> Option<&str> {
    key.strip_prefix(CAP_PREFIX).filter(|n| !n.is_empty())
}
