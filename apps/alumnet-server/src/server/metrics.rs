use std::{collections::HashMap, fmt::Write as _};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut guard) = metrics_state().auth_failures.lock() {
        *guard.entry(reason).or_insert(0) += 1;
    }
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    if let Ok(mut guard) = metrics_state().ws_disconnects.lock() {
        *guard.entry(reason).or_insert(0) += 1;
    }
}

pub(crate) fn record_gateway_event_emitted(scope: &'static str, event_type: &'static str) {
    if let Ok(mut guard) = metrics_state().gateway_events_emitted.lock() {
        *guard.entry((scope, event_type)).or_insert(0) += 1;
    }
}

pub(crate) fn record_gateway_event_dropped(
    scope: &'static str,
    event_type: &'static str,
    reason: &'static str,
) {
    if let Ok(mut guard) = metrics_state().gateway_events_dropped.lock() {
        *guard.entry((scope, event_type, reason)).or_insert(0) += 1;
    }
}

pub(crate) fn record_gateway_event_parse_rejected(reason: &'static str) {
    if let Ok(mut guard) = metrics_state().gateway_events_parse_rejected.lock() {
        *guard.entry(reason).or_insert(0) += 1;
    }
}

pub(crate) fn render_metrics() -> String {
    let auth_failures = metrics_state()
        .auth_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let ws_disconnects = metrics_state()
        .ws_disconnects
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_emitted = metrics_state()
        .gateway_events_emitted
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_dropped = metrics_state()
        .gateway_events_dropped
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let gateway_events_parse_rejected = metrics_state()
        .gateway_events_parse_rejected
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());

    let mut output = String::new();
    output
        .push_str("# HELP alumnet_auth_failures_total Count of auth-related failures by reason\n");
    output.push_str("# TYPE alumnet_auth_failures_total counter\n");
    let mut auth_entries: Vec<_> = auth_failures.into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "alumnet_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP alumnet_ws_disconnects_total Count of websocket disconnect events by reason\n",
    );
    output.push_str("# TYPE alumnet_ws_disconnects_total counter\n");
    let mut ws_entries: Vec<_> = ws_disconnects.into_iter().collect();
    ws_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in ws_entries {
        let _ = writeln!(
            output,
            "alumnet_ws_disconnects_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP alumnet_gateway_events_emitted_total Count of gateway events delivered by scope\n",
    );
    output.push_str("# TYPE alumnet_gateway_events_emitted_total counter\n");
    let mut emitted_entries: Vec<_> = gateway_events_emitted.into_iter().collect();
    emitted_entries.sort_by_key(|((scope, event_type), _)| (*scope, *event_type));
    for ((scope, event_type), value) in emitted_entries {
        let _ = writeln!(
            output,
            "alumnet_gateway_events_emitted_total{{scope=\"{scope}\",type=\"{event_type}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP alumnet_gateway_events_dropped_total Count of gateway events dropped by reason\n",
    );
    output.push_str("# TYPE alumnet_gateway_events_dropped_total counter\n");
    let mut dropped_entries: Vec<_> = gateway_events_dropped.into_iter().collect();
    dropped_entries.sort_by_key(|((scope, event_type, reason), _)| (*scope, *event_type, *reason));
    for ((scope, event_type, reason), value) in dropped_entries {
        let _ = writeln!(
            output,
            "alumnet_gateway_events_dropped_total{{scope=\"{scope}\",type=\"{event_type}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP alumnet_gateway_events_parse_rejected_total Count of rejected ingress payloads\n",
    );
    output.push_str("# TYPE alumnet_gateway_events_parse_rejected_total counter\n");
    let mut rejected_entries: Vec<_> = gateway_events_parse_rejected.into_iter().collect();
    rejected_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in rejected_entries {
        let _ = writeln!(
            output,
            "alumnet_gateway_events_parse_rejected_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output
}
