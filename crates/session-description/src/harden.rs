use tracing::trace;

/// Format-parameter line prefix for the Opus payload type we negotiate.
const OPUS_FMTP_PREFIX: &str = "a=fmtp:111 ";
const CBR_PARAM: &str = "cbr=";
const CBR_SUFFIX: &str = ";cbr=1";

/// RFC 6464 client-to-mixer audio level header extension.
pub const AUDIO_LEVEL_URN: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Rewrites an SDP payload so that it only proposes constant-bitrate Opus and
/// never advertises the plaintext audio-level header extension.
///
/// Every line keeps its original terminator and position. The function is
/// total and idempotent: `harden(&harden(s)) == harden(s)`.
pub fn harden(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len() + CBR_SUFFIX.len() * 2);
    let mut forced_cbr = 0usize;
    let mut stripped = 0usize;

    for segment in sdp.split_inclusive('\n') {
        let (body, terminator) = split_terminator(segment);

        if body.contains(AUDIO_LEVEL_URN) {
            stripped += 1;
            continue;
        }

        out.push_str(body);
        if body.starts_with(OPUS_FMTP_PREFIX) && !body.contains(CBR_PARAM) {
            out.push_str(CBR_SUFFIX);
            forced_cbr += 1;
        }
        out.push_str(terminator);
    }

    trace!(
        target = "session_description::harden",
        forced_cbr,
        stripped,
        "hardened session description"
    );
    out
}

fn split_terminator(segment: &str) -> (&str, &str) {
    if let Some(body) = segment.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = segment.strip_suffix('\n') {
        (body, "\n")
    } else {
        (segment, "")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 103\r\n\
a=mid:audio\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
a=extmap:3 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:103 ISAC/16000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:video\r\n\
a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn appends_cbr_to_opus_fmtp() {
        assert_eq!(
            harden("a=fmtp:111 minptime=10\r\n"),
            "a=fmtp:111 minptime=10;cbr=1\r\n"
        );
    }

    #[test]
    fn leaves_existing_cbr_untouched() {
        let line = "a=fmtp:111 minptime=10;cbr=0\r\n";
        assert_eq!(harden(line), line);
    }

    #[test]
    fn ignores_other_payload_types() {
        let sdp = "a=fmtp:1110 minptime=10\r\na=fmtp:96 x-google-start-bitrate=800\r\n";
        assert_eq!(harden(sdp), sdp);
    }

    #[test]
    fn strips_audio_level_extension() {
        let sdp = "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\na=mid:audio\r\n";
        assert_eq!(harden(sdp), "a=mid:audio\r\n");
    }

    #[test]
    fn keeps_every_other_line_in_order() {
        let hardened = harden(OFFER);
        let expected: Vec<&str> = OFFER
            .lines()
            .filter(|line| !line.contains(AUDIO_LEVEL_URN))
            .collect();
        let actual: Vec<&str> = hardened.lines().collect();
        assert_eq!(actual.len(), expected.len());
        for (got, want) in actual.iter().zip(expected.iter()) {
            if want.starts_with(OPUS_FMTP_PREFIX) {
                assert_eq!(*got, format!("{want};cbr=1"));
            } else {
                assert_eq!(got, want);
            }
        }
        assert!(!hardened.contains(AUDIO_LEVEL_URN));
    }

    #[test]
    fn is_idempotent() {
        let inputs = [
            OFFER,
            "",
            "a=fmtp:111 minptime=10",
            "a=fmtp:111 minptime=10\n",
            "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            "\r\n\r\n",
        ];
        for input in inputs {
            let once = harden(input);
            assert_eq!(harden(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn preserves_line_terminators() {
        assert_eq!(
            harden("a=fmtp:111 minptime=10\na=mid:0\r\nb=AS:30"),
            "a=fmtp:111 minptime=10;cbr=1\na=mid:0\r\nb=AS:30"
        );
    }

    #[test]
    fn final_line_without_terminator_is_hardened() {
        assert_eq!(harden("a=fmtp:111 stereo=1"), "a=fmtp:111 stereo=1;cbr=1");
        assert_eq!(
            harden("a=mid:audio\r\na=extmap:2 urn:ietf:params:rtp-hdrext:ssrc-audio-level"),
            "a=mid:audio\r\n"
        );
    }

    fn sdp_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "a=fmtp:111 [a-z0-9=;]{0,16}",
            "a=fmtp:1[0-9]{1,2} [a-z0-9=;]{0,8}",
            "a=extmap:[0-9] urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            "a=extmap:[0-9] urn:ietf:params:rtp-hdrext:[a-z-]{1,12}",
            "[a-z]=[ -~]{0,24}",
        ]
    }

    fn sdp() -> impl Strategy<Value = (Vec<String>, String)> {
        (
            prop::collection::vec((sdp_line(), prop_oneof![Just("\r\n"), Just("\n")]), 0..24),
            any::<bool>(),
        )
            .prop_map(|(lines, terminate_last)| {
                let mut text = String::new();
                let count = lines.len();
                let mut bodies = Vec::with_capacity(count);
                for (index, (body, terminator)) in lines.into_iter().enumerate() {
                    text.push_str(&body);
                    if terminate_last || index + 1 < count {
                        text.push_str(terminator);
                    }
                    bodies.push(body);
                }
                (bodies, text)
            })
    }

    proptest! {
        #[test]
        fn hardening_generated_sdp_is_idempotent((_, text) in sdp()) {
            let once = harden(&text);
            prop_assert_eq!(harden(&once), once);
        }

        #[test]
        fn only_audio_level_lines_are_removed((bodies, text) in sdp()) {
            let hardened = harden(&text);
            let kept: Vec<&String> = bodies
                .iter()
                .filter(|body| !body.contains(AUDIO_LEVEL_URN))
                .collect();
            let lines: Vec<&str> = hardened.lines().collect();

            prop_assert_eq!(lines.len(), kept.len());
            for (line, body) in lines.iter().zip(kept) {
                prop_assert!(line.starts_with(body.as_str()), "{line:?} lost {body:?}");
                let added = &line[body.len()..];
                prop_assert!(added.is_empty() || added == CBR_SUFFIX);
            }
            prop_assert!(!hardened.contains(AUDIO_LEVEL_URN));
        }
    }
}
