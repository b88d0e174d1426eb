#![no_main]

use hazel_runtime::notification_router::{route_notification, route_server_request};
use hazel_runtime::{parse_inbound_line, InboundFrame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match parse_inbound_line(data) {
        Ok(InboundFrame::Notification { method, params }) => {
            let _ = route_notification(&method, params);
        }
        Ok(InboundFrame::ServerRequest { method, params, .. }) => {
            let _ = route_server_request(&method, params);
        }
        _ => {}
    }
});
