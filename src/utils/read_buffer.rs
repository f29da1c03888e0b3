/// Buffer for a fixed number of bytes to be read.
///
/// The buffer is filled from a [bytes::Buf] using [ReadBuffer::put]. Once the
/// expected number of bytes are read the buffer data is returned.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Vec<u8>,
    read_count: usize,
}

impl ReadBuffer {
    pub fn new(size: usize) -> Self {
        ReadBuffer {
            data: vec![0u8; size],
            read_count: 0,
        }
    }

    /// Copy as many bytes from `data` as are still missing. Returns the
    /// complete content once the buffer is full.
    pub fn put(&mut self, data: &mut impl bytes::Buf) -> Option<Vec<u8>> {
        let need = self.data.len() - self.read_count;
        let read_count_current = std::cmp::min(data.remaining(), need);
        let end = self.read_count + read_count_current;
        data.copy_to_slice(&mut self.data[self.read_count..end]);
        self.read_count += read_count_current;
        if self.read_count == self.data.len() {
            Some(self.finish())
        } else {
            None
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        self.read_count = 0;
        std::mem::take(&mut self.data)
    }
}
