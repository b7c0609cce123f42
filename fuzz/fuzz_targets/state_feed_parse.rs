#![no_main]

use exrun_browser::{parse_state_line, session_log_entry, SessionEvent, STATE_FEED_PREFIX};
use exrun_core::LogKind;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let prefixed = format!("{STATE_FEED_PREFIX}{raw}");

    let parsed = parse_state_line(&prefixed)
        .expect("prefixed console line must be recognised as state feed");
    let entry = session_log_entry(&SessionEvent::Console {
        page_id: "fuzz-page".to_string(),
        text: prefixed,
    })
    .expect("console lines always produce an entry");
    match parsed {
        Ok(update) => {
            assert_eq!(entry.kind, LogKind::State);
            assert_eq!(entry.text, update.status_label());
            assert!(entry.data.is_some());
        }
        Err(_) => assert_eq!(entry.kind, LogKind::Trace),
    }

    if parse_state_line(&raw).is_none() {
        let entry = session_log_entry(&SessionEvent::Console {
            page_id: "fuzz-page".to_string(),
            text: raw.to_string(),
        })
        .expect("console entry");
        assert_eq!(entry.kind, LogKind::Console);
        assert_eq!(entry.text, raw);
    }
});
