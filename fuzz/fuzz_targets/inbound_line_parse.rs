#![no_main]

use hazel_runtime::{parse_inbound_line, InboundFrame, RpcId};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = parse_inbound_line(data) else {
        return;
    };
    match frame {
        InboundFrame::Reply { id, .. } | InboundFrame::ServerRequest { id, .. } => {
            let key = id.correlation_key();
            assert_eq!(RpcId::from_correlation_key(&key).correlation_key(), key);
        }
        InboundFrame::Notification { method, .. } => assert!(!method.is_empty()),
        InboundFrame::Unroutable => {}
    }
});
