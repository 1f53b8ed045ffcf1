#![no_main]

use libfuzzer_sys::fuzz_target;
use datagram_protocol::{application_events, frame, unframe, wire_struct};

wire_struct! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Blob {
        pub flag: bool,
        pub count: i32,
        pub text: String,
    }
}

application_events! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Fuzzed {
        Blob(Blob) = 1,
    }
}

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary datagrams must never panic
    if let Some(message) = unframe::<Fuzzed>(data) {
        // Anything that decodes must re-encode to something that decodes the same
        let again = unframe::<Fuzzed>(&frame(&message));
        assert_eq!(again, Some(message));
    }
});
