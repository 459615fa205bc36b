//! 从模式（非 DMA）下的 FIFO 数据搬运，按 32 位字访问

use super::reg::{OtgRegs, Reg};

pub(crate) fn write_packet<R: OtgRegs>(regs: &mut R, ch: u8, data: &[u8]) {
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        regs.write(Reg::Fifo(ch), u32::from_le_bytes(word));
    }
}

pub(crate) fn read_packet<R: OtgRegs>(regs: &R, ch: u8, out: &mut [u8]) {
    for chunk in out.chunks_mut(4) {
        let word = regs.read(Reg::Fifo(ch)).to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

/// 丢弃接收 FIFO 中 `len` 字节
pub(crate) fn drain<R: OtgRegs>(regs: &R, ch: u8, len: usize) {
    for _ in 0..len.div_ceil(4) {
        let _ = regs.read(Reg::Fifo(ch));
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque};

    use super::*;

    #[derive(Default)]
    struct Words {
        tx: Vec<u32>,
        rx: RefCell<VecDeque<u32>>,
    }

    impl OtgRegs for Words {
        fn read(&self, _reg: Reg) -> u32 {
            self.rx.borrow_mut().pop_front().unwrap_or(0)
        }

        fn write(&mut self, _reg: Reg, value: u32) {
            self.tx.push(value);
        }
    }

    #[test]
    fn partial_word_is_zero_padded() {
        let mut regs = Words::default();
        write_packet(&mut regs, 0, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(regs.tx, vec![0x0403_0201, 0x0000_0605]);
    }

    #[test]
    fn read_consumes_whole_words() {
        let regs = Words::default();
        regs.rx.borrow_mut().extend([0x0403_0201, 0x0807_0605, 0xdead_beef]);
        let mut out = [0u8; 5];
        read_packet(&regs, 0, &mut out);
        assert_eq!(out, [1, 2, 3, 4, 5]);
        assert_eq!(regs.rx.borrow().len(), 1);

        drain(&regs, 0, 3);
        assert!(regs.rx.borrow().is_empty());
    }
}
