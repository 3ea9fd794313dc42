//! Built-in pipeline stages.
//!
//! | tag        | in               | out                  |
//! |------------|------------------|----------------------|
//! | `ai_afe`   | interleaved mic  | 16 kHz mono s16le    |
//! | `rate_cvt` | mono s16le       | mono s16le, new rate |
//! | `encoder`  | mono s16le       | PCM / G.711 A / µ    |

pub mod afe;
pub mod encoder;
pub mod rate_cvt;

pub use afe::{
    AfeControl, AfeElement, AfeElementConfig, AfeEvent, AfeEventFn, RecognizerFactory, WakeState,
    WakeupInfo, AFE_TAG,
};
pub use encoder::{Encoder, EncoderConfig, EncoderFormat, ENCODER_TAG};
pub use rate_cvt::{RateConvert, RateConvertConfig, RATE_CVT_TAG};
