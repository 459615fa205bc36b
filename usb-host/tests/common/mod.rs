//! Register-level stand-in for a DWC OTG core in host mode.
#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use otg_usbh::{
    Completion, DataBuffer, DeviceId, DwcConfig, DwcOtg, HostConfig, HostHandle, Speed,
    TransferError, USBHost,
    backend::dwc::reg::{OtgRegs, Reg},
};

pub mod bits {
    pub const XFRC: u32 = 1 << 0;
    pub const CHH: u32 = 1 << 1;
    pub const STALL: u32 = 1 << 3;
    pub const NAK: u32 = 1 << 4;
    pub const ACK: u32 = 1 << 5;
    pub const TXERR: u32 = 1 << 7;
    pub const BBERR: u32 = 1 << 8;
    pub const FRMOR: u32 = 1 << 9;
    pub const DTERR: u32 = 1 << 10;

    pub const CHENA: u32 = 1 << 31;
    pub const CHDIS: u32 = 1 << 30;
    pub const ODDFRM: u32 = 1 << 29;
    pub const LSDEV: u32 = 1 << 17;
    pub const EPDIR_IN: u32 = 1 << 15;

    pub const PCSTS: u32 = 1 << 0;
    pub const PCDET: u32 = 1 << 1;
    pub const PENA: u32 = 1 << 2;
    pub const PENCHNG: u32 = 1 << 3;
    pub const POCCHNG: u32 = 1 << 5;
    pub const PRST: u32 = 1 << 8;
    pub const HPRT_W1C: u32 = PCDET | PENA | PENCHNG | POCCHNG;
    pub const HPRT_RO: u32 = PCSTS | (1 << 4) | (3 << 17);

    pub const RXFLVL: u32 = 1 << 4;
    pub const HCINT: u32 = 1 << 25;
    pub const DISCINT: u32 = 1 << 29;

    pub const AHBIDL: u32 = 1 << 31;
}

use bits::*;

#[derive(Default)]
pub struct SimState {
    plain: HashMap<usize, u32>,
    hcint: [u32; 16],
    hcintmsk: [u32; 16],
    hcchar: [u32; 16],
    hctsiz: [u32; 16],
    hprt: u32,
    gintsts: u32,
    frame: u16,
    rx_status: VecDeque<u32>,
    rx_data: VecDeque<u32>,
    tx: [Vec<u32>; 16],
    arms: [usize; 16],
}

impl SimState {
    fn haint(&self) -> u32 {
        (0..16)
            .filter(|&i| self.hcint[i] & self.hcintmsk[i] != 0)
            .fold(0, |acc, i| acc | (1 << i))
    }
}

#[derive(Clone, Default)]
pub struct SimRegs(Rc<RefCell<SimState>>);

impl OtgRegs for SimRegs {
    fn read(&self, reg: Reg) -> u32 {
        let mut s = self.0.borrow_mut();
        match reg {
            Reg::Gintsts => {
                let mut v = s.gintsts;
                if !s.rx_status.is_empty() {
                    v |= RXFLVL;
                }
                if s.haint() != 0 {
                    v |= HCINT;
                }
                v
            }
            Reg::Haint => s.haint(),
            Reg::Grxstsp => s.rx_status.pop_front().unwrap_or(0),
            Reg::Fifo(_) => s.rx_data.pop_front().unwrap_or(0),
            Reg::Grstctl => AHBIDL,
            Reg::Hfnum => s.frame as u32,
            Reg::Hprt => s.hprt,
            Reg::Hcchar(n) => s.hcchar[n as usize],
            Reg::Hcint(n) => s.hcint[n as usize],
            Reg::Hcintmsk(n) => s.hcintmsk[n as usize],
            Reg::Hctsiz(n) => s.hctsiz[n as usize],
            other => s.plain.get(&other.offset()).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        let mut s = self.0.borrow_mut();
        match reg {
            Reg::Gintsts => s.gintsts &= !value,
            Reg::Hcint(n) => s.hcint[n as usize] &= !value,
            Reg::Hcintmsk(n) => s.hcintmsk[n as usize] = value,
            Reg::Hctsiz(n) => s.hctsiz[n as usize] = value,
            Reg::Hcchar(n) => {
                let n = n as usize;
                if value & CHDIS != 0 {
                    s.hcchar[n] = value & !(CHENA | CHDIS);
                    s.hcint[n] |= CHH;
                } else {
                    s.hcchar[n] = value;
                    if value & CHENA != 0 {
                        s.arms[n] += 1;
                    }
                }
            }
            Reg::Hprt => {
                let old = s.hprt;
                let mut hprt = old & !(value & HPRT_W1C);
                hprt = (hprt & (HPRT_W1C | HPRT_RO)) | (value & !(HPRT_W1C | HPRT_RO));
                if old & PRST != 0 && hprt & PRST == 0 && hprt & PCSTS != 0 {
                    hprt |= PENA | PENCHNG;
                }
                s.hprt = hprt;
            }
            Reg::Fifo(n) => s.tx[n as usize].push(value),
            other => {
                s.plain.insert(other.offset(), value);
            }
        }
    }
}

impl SimRegs {
    pub fn connect(&self, speed: Speed) {
        let pspd = match speed {
            Speed::High => 0,
            Speed::Low => 2,
            _ => 1,
        };
        let mut s = self.0.borrow_mut();
        s.hprt = (s.hprt & !(3 << 17)) | PCSTS | PCDET | (pspd << 17);
    }

    pub fn disconnect(&self) {
        let mut s = self.0.borrow_mut();
        let was_enabled = s.hprt & PENA != 0;
        s.hprt &= !(PCSTS | PENA);
        if was_enabled {
            s.hprt |= PENCHNG;
        }
        s.gintsts |= DISCINT;
    }

    pub fn set_frame(&self, frame: u16) {
        self.0.borrow_mut().frame = frame & 0x3FFF;
    }

    pub fn raise(&self, ch: usize, bits: u32) {
        self.0.borrow_mut().hcint[ch] |= bits;
    }

    fn take_packet(s: &mut SimState, ch: usize) {
        let pktcnt = (s.hctsiz[ch] >> 19) & 0x3FF;
        if pktcnt > 0 {
            s.hctsiz[ch] = (s.hctsiz[ch] & !(0x3FF << 19)) | ((pktcnt - 1) << 19);
        }
    }

    /// Device answers an OUT packet with ACK.
    pub fn out_ack(&self, ch: usize) {
        let mut s = self.0.borrow_mut();
        Self::take_packet(&mut s, ch);
        s.hcint[ch] |= ACK;
    }

    /// Device answers with NAK, the channel halts.
    pub fn nak(&self, ch: usize) {
        let mut s = self.0.borrow_mut();
        s.hcchar[ch] &= !CHENA;
        s.hcint[ch] |= NAK;
    }

    /// One IN data packet lands in the receive FIFO.
    pub fn in_packet(&self, ch: usize, data: &[u8]) {
        let mut s = self.0.borrow_mut();
        Self::take_packet(&mut s, ch);
        s.hcchar[ch] &= !CHENA;
        s.rx_status
            .push_back((2 << 17) | ((data.len() as u32) << 4) | ch as u32);
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            s.rx_data.push_back(u32::from_le_bytes(word));
        }
    }

    pub fn hcchar(&self, ch: usize) -> u32 {
        self.0.borrow().hcchar[ch]
    }

    pub fn hctsiz(&self, ch: usize) -> u32 {
        self.0.borrow().hctsiz[ch]
    }

    pub fn pktcnt(&self, ch: usize) -> u32 {
        (self.hctsiz(ch) >> 19) & 0x3FF
    }

    pub fn dpid(&self, ch: usize) -> u32 {
        (self.hctsiz(ch) >> 29) & 0x3
    }

    pub fn hcintmsk(&self, ch: usize) -> u32 {
        self.0.borrow().hcintmsk[ch]
    }

    pub fn arms(&self, ch: usize) -> usize {
        self.0.borrow().arms[ch]
    }

    pub fn plain(&self, reg: Reg) -> u32 {
        self.0.borrow().plain.get(&reg.offset()).copied().unwrap_or(0)
    }

    pub fn hprt(&self) -> u32 {
        self.0.borrow().hprt
    }

    pub fn tx_bytes(&self, ch: usize) -> Vec<u8> {
        self.0.borrow().tx[ch]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    pub fn tx_words(&self, ch: usize) -> usize {
        self.0.borrow().tx[ch].len()
    }

    pub fn clear_tx(&self) {
        for tx in self.0.borrow_mut().tx.iter_mut() {
            tx.clear();
        }
    }

    pub fn rx_pending(&self) -> usize {
        self.0.borrow().rx_data.len()
    }
}

pub type Host = USBHost<DwcOtg<SimRegs>>;

/// What the callbacks observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(DeviceId),
    Done {
        urb: Option<u64>,
        result: Result<usize, TransferError>,
        user_data: usize,
    },
    Disconnected(DeviceId),
}

thread_local! {
    static SEEN: RefCell<Vec<Seen>> = const { RefCell::new(Vec::new()) };
}

pub fn seen() -> Vec<Seen> {
    SEEN.with(|s| s.borrow().clone())
}

pub fn take_seen() -> Vec<Seen> {
    SEEN.with(|s| std::mem::take(&mut *s.borrow_mut()))
}

pub fn on_connected(_host: &mut dyn HostHandle, dev: DeviceId) {
    SEEN.with(|s| s.borrow_mut().push(Seen::Connected(dev)));
}

pub fn on_done(_host: &mut dyn HostHandle, completion: &Completion) {
    SEEN.with(|s| {
        s.borrow_mut().push(Seen::Done {
            urb: completion.urb.map(|id| id.get()),
            result: completion.result,
            user_data: completion.transfer.user_data,
        })
    });
}

pub fn on_disconnected(_host: &mut dyn HostHandle, dev: DeviceId) {
    SEEN.with(|s| s.borrow_mut().push(Seen::Disconnected(dev)));
}

pub fn init_log() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

pub fn new_host() -> (Host, SimRegs) {
    init_log();
    take_seen();
    let sim = SimRegs::default();
    let mut host: Host =
        USBHost::new_dwc(sim.clone(), DwcConfig::default(), HostConfig::default()).unwrap();
    host.register_connected_callback(on_connected);
    (host, sim)
}

pub fn buffer(len: usize) -> DataBuffer {
    DataBuffer::new(Box::leak(vec![0u8; len].into_boxed_slice()))
}

pub fn buffer_with(data: &[u8]) -> DataBuffer {
    DataBuffer::new(Box::leak(data.to_vec().into_boxed_slice()))
}

/// Channels currently serving an URB.
pub fn busy_channels(host: &Host) -> Vec<usize> {
    (0..8)
        .filter(|&i| host.backend().channel_state(i).is_some_and(|s| s.is_busy()))
        .collect()
}

pub fn busy_channel(host: &Host) -> usize {
    let busy = busy_channels(host);
    assert_eq!(busy.len(), 1, "expected exactly one busy channel, got {busy:?}");
    busy[0]
}

/// Runs port reset handling until the root port reports a connection.
pub fn bring_up_port(host: &mut Host, sim: &SimRegs, speed: Speed) {
    sim.connect(speed);
    host.poll(1_000);
    host.poll(10_000);
    if speed != Speed::High {
        // PHY clock switch needs a second reset
        host.poll(10_000);
    }
}

/// Answers the SET_ADDRESS and GET_DESCRIPTOR(8) requests of enumeration.
pub fn answer_enumeration(host: &mut Host, sim: &SimRegs, max_packet_size0: u8) {
    // SET_ADDRESS: setup, status IN
    let ch = busy_channel(host);
    sim.raise(ch, XFRC);
    host.poll(1_000);
    sim.raise(ch, XFRC);
    host.poll(1_000);

    // GET_DESCRIPTOR: setup, data IN, status OUT
    let ch = busy_channel(host);
    sim.raise(ch, XFRC);
    host.poll(1_000);
    sim.in_packet(ch, &[18, 1, 0x00, 0x02, 0, 0, 0, max_packet_size0]);
    sim.raise(ch, XFRC);
    host.poll(1_000);
    sim.raise(ch, XFRC);
    host.poll(1_000);

    // let the last channel halt
    host.poll(1_000);
}

/// Connects and enumerates a device on the root port.
pub fn attach(host: &mut Host, sim: &SimRegs, speed: Speed, max_packet_size0: u8) -> DeviceId {
    bring_up_port(host, sim, speed);
    answer_enumeration(host, sim, max_packet_size0);
    let seen = take_seen();
    let dev = match seen.as_slice() {
        [Seen::Connected(dev)] => *dev,
        other => panic!("expected one connection, got {other:?}"),
    };
    assert!(busy_channels(host).is_empty());
    sim.clear_tx();
    dev
}
