use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use speaker_core::codec::NullCodec;
use speaker_core::elements::AfeEvent;
use speaker_core::graph::SoundInfo;
use speaker_core::player::SimplePlayerConfig;
use speaker_core::processor::{simple_players, AudioProcessor, ProcessorConfig};
use speaker_core::SpeakerError;

fn wait_for(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(2), "condition not reached");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn processor() -> AudioProcessor {
    AudioProcessor::new(
        ProcessorConfig::default(),
        Arc::new(NullCodec::default()),
        Arc::new(NullCodec::paced(SoundInfo::new(16_000, 1, 16))),
        simple_players(SimplePlayerConfig::default()),
    )
    .unwrap()
}

fn read_exact(proc: &AudioProcessor, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; len];
    while out.len() < len {
        let n = proc.recorder_read_data(&mut buf[..len - out.len()]).unwrap();
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn recorder_streams_encoded_silence_and_reports_wake() {
    let proc = processor();
    let events: Arc<Mutex<Vec<AfeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    proc.recorder_open(Arc::new(move |ev: &AfeEvent| sink.lock().push(ev.clone())))
        .unwrap();

    // 40 ms of 8 kHz A-law.
    let data = read_exact(&proc, 320);
    assert!(data.iter().all(|b| *b == 0xD5));

    proc.trigger_wakeup().unwrap();
    wait_for(|| {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, AfeEvent::WakeupStart(_)))
    });

    proc.recorder_close().unwrap();
    assert!(matches!(
        proc.recorder_read_data(&mut [0u8; 16]),
        Err(SpeakerError::InvalidState(_))
    ));
    proc.shutdown();
}

#[test]
fn blocked_reader_is_released_by_close() {
    let proc = Arc::new(processor());
    proc.recorder_open(Arc::new(|_: &AfeEvent| {})).unwrap();
    proc.suspend(true).unwrap();

    let reader = {
        let proc = Arc::clone(&proc);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if let Err(e) = proc.recorder_read_data(&mut buf) {
                    return e;
                }
            }
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    proc.recorder_close().unwrap();
    let err = reader.join().unwrap();
    assert!(err.is_aborted() || matches!(err, SpeakerError::InvalidState(_)));
}
