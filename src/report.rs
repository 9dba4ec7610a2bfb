use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::debug;

const MAX_NOTE_LEN: usize = 1024;

pub async fn report(
    recorder: &Recorder,
    reference: &ObjectReference,
    type_: EventType,
    action: &str,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        action: action.to_string(),
        reason: reason.to_string(),
        note: Some(truncate_note(note)),
        secondary: None,
    };

    // ignore the error of diagnostic events
    if let Err(err) = recorder.publish(&event, reference).await {
        debug!(%err, action, reason, "failed to publish event");
    }
}

fn truncate_note(note: String) -> String {
    if note.len() <= MAX_NOTE_LEN {
        return note;
    }

    let mut boundary = MAX_NOTE_LEN - "...".len();
    while !note.is_char_boundary(boundary) {
        boundary -= 1;
    }

    format!("{}...", &note[..boundary])
}
