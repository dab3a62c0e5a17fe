use crate::arch::{words_for, WORD_SIZE};
use crate::{ProcessFrame, ProcessIdentifier, ReattachError, ReattachResult};

pub trait MemoryAccessor {
    /// Read `count` consecutive words starting at `addr`.
    fn read_words(&mut self, addr: usize, count: usize) -> ReattachResult<Vec<u64>>;

    /// Write `words` consecutively starting at `addr`.
    ///
    /// On error an unknown prefix of `words` has already been applied.
    fn write_words(&mut self, addr: usize, words: &[u64]) -> ReattachResult<()>;
}

impl<T> MemoryAccessor for ProcessFrame<T>
where
    T: ProcessIdentifier,
{
    fn read_words(&mut self, addr: usize, count: usize) -> ReattachResult<Vec<u64>> {
        let pid = self.pid();
        let mut words = Vec::with_capacity(count);
        for i in 0..count {
            let at = addr + i * WORD_SIZE;
            // PEEKDATA returns the word itself, so -1 is ambiguous without errno.
            let word = unsafe {
                *libc::__errno_location() = 0;
                libc::ptrace(libc::PTRACE_PEEKDATA, pid, at, 0)
            };
            if word == -1 {
                let source = std::io::Error::last_os_error();
                if source.raw_os_error().unwrap_or(0) != 0 {
                    return Err(ReattachError::MemoryAccess { addr: at, source });
                }
            }
            words.push(word as u64);
        }
        tracing::trace!("Read {count} words at {addr:#x}");
        Ok(words)
    }

    fn write_words(&mut self, addr: usize, words: &[u64]) -> ReattachResult<()> {
        let pid = self.pid();
        for (i, word) in words.iter().enumerate() {
            let at = addr + i * WORD_SIZE;
            let result = unsafe { libc::ptrace(libc::PTRACE_POKEDATA, pid, at, *word) };
            if result == -1 {
                return Err(ReattachError::MemoryAccess {
                    addr: at,
                    source: std::io::Error::last_os_error(),
                });
            }
        }
        tracing::trace!("Wrote {} words at {addr:#x}", words.len());
        Ok(())
    }
}

pub fn bytes_to_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks(WORD_SIZE)
        .map(|chunk| {
            let mut word = [0u8; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect()
}

pub fn words_to_bytes(words: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * WORD_SIZE);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Read `len` bytes at the word-aligned address `addr`.
pub fn read_bytes(memory: &mut impl MemoryAccessor, addr: usize, len: usize) -> ReattachResult<Vec<u8>> {
    let mut bytes = words_to_bytes(&memory.read_words(addr, words_for(len))?);
    bytes.truncate(len);
    Ok(bytes)
}
