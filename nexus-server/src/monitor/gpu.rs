//! GPU sampling is out of scope: no vendor SDK is bundled, so this always
//! reports an empty sample set rather than shipping a partial NVML/ROCm
//! integration.

use super::Sample;

pub fn sample() -> Vec<Sample> {
    Vec::new()
}
