use ssmtune_protocol_lib::Request;
use std::collections::BTreeMap;

/// Absolute device address to byte
pub type PatchMap = BTreeMap<u32, u8>;

/// Group a patch into write requests.
///
/// Consecutive addresses become block writes of at most `max_block` bytes;
/// a lone byte becomes a single-address write.
#[must_use]
pub fn plan_writes(patch: &PatchMap, max_block: usize) -> Vec<Request> {
    let max_block = max_block.max(1);
    let mut requests = Vec::new();
    let mut run: Option<(u32, Vec<u8>)> = None;

    for (&address, &value) in patch {
        if let Some((start, data)) = &mut run {
            if data.len() < max_block && u64::from(*start) + data.len() as u64 == u64::from(address) {
                data.push(value);
                continue;
            }
        }
        if let Some((start, data)) = run.replace((address, vec![value])) {
            requests.push(write_request(start, data));
        }
    }
    if let Some((start, data)) = run {
        requests.push(write_request(start, data));
    }
    requests
}

fn write_request(address: u32, data: Vec<u8>) -> Request {
    match data.as_slice() {
        [value] => Request::WriteAddress {
            address,
            value: *value,
        },
        _ => Request::WriteBlock { address, data },
    }
}

/// Apply a patch to a byte buffer that starts at `base`; addresses outside
/// the buffer are skipped. Returns the number of bytes written.
pub fn apply(patch: &PatchMap, base: u32, buffer: &mut [u8]) -> usize {
    let mut written = 0;
    for (&address, &value) in patch {
        let Some(offset) = address.checked_sub(base) else {
            continue;
        };
        if let Some(slot) = buffer.get_mut(offset as usize) {
            *slot = value;
            written += 1;
        }
    }
    written
}
