//! DWC OTG (DesignWare USB 2.0 On-The-Go) 主机后端
//!
//! 工作在从模式（slave mode）：数据由 CPU 通过 FIFO 搬运，每个硬件通道
//! 同一时刻只服务一个 URB。通道完成、NAK 重试、周期调度都在 [`HostOp::poll`]
//! 中处理，完成结果交给 [`Bus`] 排队，由主机派发回调。

use tock_registers::fields::FieldValue;
use usb_if::{
    Speed,
    err::{InvalidRequest, TransferError},
    transfer::{Direction, EndpointAddress, EndpointType, SetupPacket},
};

use crate::{
    backend::ty::{
        HostOp,
        transfer::{Transfer, TransferFlags},
    },
    bus::Bus,
    err::{Result, USBError},
    frame::FrameNumber,
    urb::UrbSlot,
};

mod channel;
mod fifo;
pub mod reg;

pub use channel::ChannelState;
use channel::Channel;
use reg::*;

/// 控制器配置
#[derive(Debug, Clone)]
pub struct DwcConfig {
    /// 接收 FIFO 深度，单位字
    pub rx_fifo_words: u16,
    /// 非周期发送 FIFO 深度，单位字
    pub tx_np_fifo_words: u16,
    /// 周期发送 FIFO 深度，单位字
    pub tx_p_fifo_words: u16,
    /// 端口复位保持时间，微秒
    pub reset_hold_us: u64,
    /// 等待核心复位、FIFO 刷新时最多轮询的次数
    pub reset_spin_limit: u32,
}

impl DwcConfig {
    /// STM32F4 OTG_FS, 1.25 KiB FIFO RAM
    pub fn stm32_otg_fs() -> Self {
        Self {
            rx_fifo_words: 128,
            tx_np_fifo_words: 64,
            tx_p_fifo_words: 64,
            ..Default::default()
        }
    }

    /// STM32F4 OTG_HS, 4 KiB FIFO RAM
    pub fn stm32_otg_hs() -> Self {
        Self {
            rx_fifo_words: 512,
            tx_np_fifo_words: 128,
            tx_p_fifo_words: 256,
            ..Default::default()
        }
    }
}

impl Default for DwcConfig {
    fn default() -> Self {
        Self {
            rx_fifo_words: 128,
            tx_np_fifo_words: 64,
            tx_p_fifo_words: 64,
            reset_hold_us: 10_000,
            reset_spin_limit: 100_000,
        }
    }
}

/// URB 中与通道编程相关的参数
#[derive(Clone, Copy)]
struct Pipe {
    address: u8,
    low_speed: bool,
    ep_type: EndpointType,
    ep: EndpointAddress,
    ep_size: u16,
    length: usize,
    flags: TransferFlags,
    interval: u16,
    setup: Option<SetupPacket>,
    toggle: bool,
}

impl Pipe {
    fn of(bus: &Bus, slot: UrbSlot) -> Option<Self> {
        let urb = bus.urb(slot)?;
        let dev = bus.device(urb.transfer().device)?;
        let t: &Transfer = urb.transfer();
        Some(Self {
            address: dev.address(),
            low_speed: dev.speed() == Speed::Low,
            ep_type: t.ep_type,
            ep: t.ep_address,
            ep_size: t.ep_size,
            length: t.length,
            flags: t.flags,
            interval: t.interval,
            setup: t.setup,
            toggle: dev.toggle(t.ep_address),
        })
    }

    fn periodic(&self) -> bool {
        self.ep_type.is_periodic()
    }

    /// 控制传输逐阶段指定 PID，同步传输没有握手，二者都不维护翻转位
    fn tracks_toggle(&self) -> bool {
        matches!(self.ep_type, EndpointType::Bulk | EndpointType::Interrupt)
    }

    /// 数据阶段方向，控制传输取自 setup 包
    fn data_direction(&self) -> Direction {
        match self.setup {
            Some(setup) if self.ep_type == EndpointType::Control => setup.direction(),
            _ => self.ep.direction(),
        }
    }

    /// 数据阶段包数，至少 1 个；OUT 传输按需追加零长包
    fn packet_count(&self) -> u32 {
        let size = self.ep_size.max(1) as usize;
        let mut count = self.length.div_ceil(size).max(1);
        let zlp = self.ep_type != EndpointType::Control
            && self.flags.contains(TransferFlags::ZERO_PACKET)
            && self.data_direction() == Direction::Out
            && self.length != 0
            && self.length % size == 0;
        if zlp {
            count += 1;
        }
        count as u32
    }

    fn hcchar(&self, dir: Direction) -> FieldValue<u32, HCCHAR::Register> {
        let eptyp: u8 = self.ep_type.into();
        let mut value = HCCHAR::CHENA::SET
            + HCCHAR::DAD.val(self.address as u32)
            + HCCHAR::MCNT.val(1)
            + HCCHAR::EPTYP.val(eptyp as u32)
            + HCCHAR::EPNUM.val(self.ep.number() as u32)
            + HCCHAR::MPSIZ.val(self.ep_size as u32);
        if dir == Direction::In {
            value = value + HCCHAR::EPDIR::In;
        }
        if self.low_speed {
            value = value + HCCHAR::LSDEV::SET;
        }
        value
    }
}

/// DWC OTG 主机控制器，`CHANNELS` 为硬件通道数
pub struct DwcOtg<R: OtgRegs, const CHANNELS: usize = 8> {
    regs: R,
    config: DwcConfig,
    channels: [Channel; CHANNELS],
    /// 端口复位结束时刻
    wait_till: u64,
}

impl<R: OtgRegs, const CHANNELS: usize> DwcOtg<R, CHANNELS> {
    pub fn new(regs: R, config: DwcConfig) -> Self {
        Self {
            regs,
            config,
            channels: [Channel::IDLE; CHANNELS],
            wait_till: 0,
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn channel_state(&self, ch: usize) -> Option<ChannelState> {
        self.channels.get(ch).map(|c| c.state)
    }

    /// 指定通道是否在等待调度
    pub fn channel_parked(&self, ch: usize) -> Option<(bool, FrameNumber)> {
        self.channels
            .get(ch)
            .map(|c| (c.need_scheduling, c.submit_frame))
    }

    fn frame(&self) -> FrameNumber {
        let hfnum = self.regs.read_as::<HFNUM::Register>(Reg::Hfnum);
        FrameNumber::new(hfnum.read(HFNUM::FRNUM) as u16)
    }

    /// HPRT 当前值去掉 W1C 位，供读-改-写使用
    fn hprt_preserved(&self) -> u32 {
        self.regs.read(Reg::Hprt) & !HPRT_W1C
    }

    fn spin_until(&self, mut done: impl FnMut(&R) -> bool) -> Result {
        for _ in 0..self.config.reset_spin_limit {
            if done(&self.regs) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(USBError::Timeout)
    }

    fn core_reset(&mut self) -> Result {
        let ahb_idle =
            |r: &R| r.read_as::<GRSTCTL::Register>(Reg::Grstctl).is_set(GRSTCTL::AHBIDL);

        self.spin_until(ahb_idle)?;
        self.regs.write_fields(Reg::Grstctl, GRSTCTL::CSRST::SET);
        self.spin_until(|r| {
            !r.read_as::<GRSTCTL::Register>(Reg::Grstctl)
                .is_set(GRSTCTL::CSRST)
        })?;
        self.spin_until(ahb_idle)?;
        debug!("core soft reset done");
        Ok(())
    }

    /// 划分 FIFO RAM 并清空所有 FIFO
    fn prepare_fifo(&mut self) {
        let rx = self.config.rx_fifo_words as u32;
        let tx_np = self.config.tx_np_fifo_words as u32;
        let tx_p = self.config.tx_p_fifo_words as u32;

        self.regs.write(Reg::Grxfsiz, rx);
        self.regs.write_fields(
            Reg::Gnptxfsiz,
            TXFSIZ::DEPTH.val(tx_np) + TXFSIZ::START.val(rx),
        );
        self.regs.write_fields(
            Reg::Hptxfsiz,
            TXFSIZ::DEPTH.val(tx_p) + TXFSIZ::START.val(rx + tx_np),
        );

        self.regs.write_fields(
            Reg::Grstctl,
            GRSTCTL::RXFFLSH::SET + GRSTCTL::TXFFLSH::SET + GRSTCTL::TXFNUM::All,
        );
        let flushed = self.spin_until(|r| {
            let v = r.read_as::<GRSTCTL::Register>(Reg::Grstctl);
            !v.is_set(GRSTCTL::RXFFLSH) && !v.is_set(GRSTCTL::TXFFLSH)
        });
        if flushed.is_err() {
            warn!("FIFO flush did not finish");
        }
    }

    fn free_channel(&self) -> Option<usize> {
        self.channels
            .iter()
            .position(|ch| ch.state == ChannelState::Free)
    }

    fn channel_of(&self, slot: UrbSlot) -> Option<usize> {
        self.channels.iter().position(|ch| ch.urb == Some(slot))
    }

    /// 停止通道并解除与 URB 的绑定，通道在 CHH 到来前保持 Cancelled
    fn release(&mut self, bus: &mut Bus, i: usize) {
        let ch = &mut self.channels[i];
        if let Some(slot) = ch.urb.take() {
            bus.detach_channel(slot);
        }
        ch.state = ChannelState::Cancelled;
        ch.need_scheduling = false;

        let n = i as u8;
        self.regs.write_fields(Reg::Hcintmsk(n), HCINT::CHH::SET);
        self.regs.write(Reg::Hcint(n), HCINT_ALL);
        self.regs.write(Reg::Hctsiz(n), 0);
        self.regs
            .write_fields(Reg::Hcchar(n), HCCHAR::CHENA::SET + HCCHAR::CHDIS::SET);
    }

    fn reset_channels(&mut self, bus: &mut Bus) {
        for i in 0..CHANNELS {
            self.release(bus, i);
        }
    }

    /// 结束通道上的 URB
    fn finish(&mut self, bus: &mut Bus, i: usize, result: core::result::Result<(), TransferError>) {
        let Some(slot) = self.channels[i].urb else {
            return;
        };
        self.release(bus, i);
        bus.complete(slot, result);
    }

    fn arm(
        &mut self,
        i: usize,
        tsiz: FieldValue<u32, HCTSIZ::Register>,
        hcchar: FieldValue<u32, HCCHAR::Register>,
    ) {
        let n = i as u8;
        self.regs.write(Reg::Hcint(n), HCINT_ALL);
        self.regs.write(Reg::Hcintmsk(n), HCINT_ALL);
        self.regs.write_fields(Reg::Hctsiz(n), tsiz);
        self.regs.write_fields(Reg::Hcchar(n), hcchar);
    }

    fn push_packet(&mut self, bus: &mut Bus, i: usize) {
        let Some(slot) = self.channels[i].urb else {
            return;
        };
        let regs = &mut self.regs;
        bus.packet_out(slot, |data| fifo::write_packet(regs, i as u8, data));
    }

    fn control_setup_stage(&mut self, bus: &mut Bus, i: usize, pipe: &Pipe) {
        let Some(setup) = pipe.setup else {
            self.finish(bus, i, Err(InvalidRequest::MissingSetup.into()));
            return;
        };
        let frame = self.frame();
        let ch = &mut self.channels[i];
        ch.state = ChannelState::ControlSetup;
        ch.need_scheduling = false;
        ch.submit_frame = frame;

        self.arm(
            i,
            HCTSIZ::DPID::MData
                + HCTSIZ::PKTCNT.val(1)
                + HCTSIZ::XFRSIZ.val(SetupPacket::LEN as u32),
            pipe.hcchar(Direction::Out),
        );
        fifo::write_packet(&mut self.regs, i as u8, &setup.to_bytes());
        trace!("ch{i}: SETUP {:?}", setup);
    }

    fn control_data_stage(&mut self, bus: &mut Bus, i: usize, pipe: &Pipe) {
        let dir = pipe.data_direction();
        let frame = self.frame();
        let ch = &mut self.channels[i];
        ch.state = match dir {
            Direction::In => ChannelState::ControlDataIn,
            Direction::Out => ChannelState::ControlDataOut,
        };
        ch.need_scheduling = false;
        ch.submit_frame = frame;

        self.arm(
            i,
            HCTSIZ::DPID::Data1
                + HCTSIZ::PKTCNT.val(pipe.packet_count())
                + HCTSIZ::XFRSIZ.val(pipe.length as u32),
            pipe.hcchar(dir),
        );
        if dir == Direction::Out {
            self.push_packet(bus, i);
        }
        trace!("ch{i}: DATA {:?} {} bytes", dir, pipe.length);
    }

    fn control_status_stage(&mut self, i: usize, pipe: &Pipe) {
        // 状态阶段方向与数据阶段相反，无数据阶段时为 IN
        let dir = if pipe.length != 0 && pipe.data_direction() == Direction::In {
            Direction::Out
        } else {
            Direction::In
        };
        let frame = self.frame();
        let ch = &mut self.channels[i];
        ch.state = match dir {
            Direction::In => ChannelState::ControlStatusIn,
            Direction::Out => ChannelState::ControlStatusOut,
        };
        ch.need_scheduling = false;
        ch.submit_frame = frame;

        self.arm(
            i,
            HCTSIZ::DPID::Data1 + HCTSIZ::PKTCNT.val(1) + HCTSIZ::XFRSIZ.val(0),
            pipe.hcchar(dir),
        );
        trace!("ch{i}: STATUS {:?}", dir);
    }

    fn data_transfer(&mut self, bus: &mut Bus, i: usize, pipe: &Pipe) {
        let dir = pipe.ep.direction();
        let frame = self.frame();
        let ch = &mut self.channels[i];
        ch.state = ChannelState::Callback;
        ch.need_scheduling = false;
        ch.submit_frame = frame;

        let dpid = if pipe.toggle && pipe.tracks_toggle() {
            HCTSIZ::DPID::Data1
        } else {
            HCTSIZ::DPID::Data0
        };
        let mut hcchar = pipe.hcchar(dir);
        if pipe.periodic() && frame.add(1).is_odd() {
            hcchar = hcchar + HCCHAR::ODDFRM::SET;
        }

        self.arm(
            i,
            dpid + HCTSIZ::PKTCNT.val(pipe.packet_count()) + HCTSIZ::XFRSIZ.val(pipe.length as u32),
            hcchar,
        );
        if dir == Direction::Out {
            self.push_packet(bus, i);
        }
        trace!(
            "ch{i}: {:?} {:?} {} bytes in {} packets",
            pipe.ep_type,
            dir,
            pipe.length,
            pipe.packet_count()
        );
    }

    /// 周期传输推进到下一个服务帧
    fn advance_periodic(&mut self, i: usize, pipe: &Pipe) -> LocalCopy<HCCHAR::Register> {
        let ch = &mut self.channels[i];
        ch.submit_frame = ch.submit_frame.add(pipe.interval);
        let odd = ch.submit_frame.is_odd();

        let mut hcchar = self.regs.read_as::<HCCHAR::Register>(Reg::Hcchar(i as u8));
        hcchar.modify(if odd {
            HCCHAR::ODDFRM::SET
        } else {
            HCCHAR::ODDFRM::CLEAR
        });
        hcchar
    }

    /// 使能到达服务帧的通道
    fn schedule_channels(&mut self) {
        let current = self.frame();
        for i in 0..CHANNELS {
            let ch = &mut self.channels[i];
            if !ch.need_scheduling || !current.is_due(ch.submit_frame, true) {
                continue;
            }
            ch.need_scheduling = false;
            trace!("ch{i}: scheduled at frame {current}");
            self.regs.modify(Reg::Hcchar(i as u8), HCCHAR::CHENA::SET);
        }
    }

    /// 处理根端口状态，返回 false 表示端口复位尚未结束
    fn poll_port(&mut self, bus: &mut Bus, now: u64) -> bool {
        let hprt = self.regs.read_as::<HPRT::Register>(Reg::Hprt);
        if hprt.is_set(HPRT::PCDET) {
            info!("port: device connected, resetting");
            self.wait_till = now + self.config.reset_hold_us;
            let value = self.hprt_preserved();
            self.regs
                .write(Reg::Hprt, (HPRT::PCDET::SET + HPRT::PRST::SET).modify(value));
        }

        let hprt = self.regs.read_as::<HPRT::Register>(Reg::Hprt);
        if hprt.is_set(HPRT::PRST) {
            if now < self.wait_till {
                return false;
            }
            let value = self.hprt_preserved();
            self.regs.write(Reg::Hprt, HPRT::PRST::CLEAR.modify(value));
            debug!("port: reset released");
        }

        let hprt = self.regs.read_as::<HPRT::Register>(Reg::Hprt);
        if hprt.is_set(HPRT::PENCHNG) {
            if hprt.is_set(HPRT::PENA) {
                self.regs.write(Reg::Gintsts, u32::MAX);
                if !self.port_enabled(bus, hprt, now) {
                    return false;
                }
            } else {
                let value = self.hprt_preserved();
                self.regs.write(Reg::Hprt, HPRT::PENCHNG::SET.modify(value));
                debug!("port: disabled");
            }
        }

        let gintsts = self.regs.read_as::<GINTSTS::Register>(Reg::Gintsts);
        if gintsts.is_set(GINTSTS::DISCINT) {
            self.regs.write_fields(Reg::Gintsts, GINTSTS::DISCINT::SET);
            info!("port: device disconnected");
            self.reset_channels(bus);
            bus.port_disconnected();
        }
        true
    }

    /// 端口使能后按速度配置 PHY 时钟，时钟不匹配时重新复位端口
    fn port_enabled(&mut self, bus: &mut Bus, hprt: LocalCopy<HPRT::Register>, now: u64) -> bool {
        let (speed, clock) = match hprt.read_as_enum(HPRT::PSPD) {
            Some(HPRT::PSPD::Value::Full) => {
                (Speed::Full, Some((HCFG::FSLSPCS::Clock48MHz, 48_000)))
            }
            Some(HPRT::PSPD::Value::Low) => (Speed::Low, Some((HCFG::FSLSPCS::Clock6MHz, 6_000))),
            Some(HPRT::PSPD::Value::High) => (Speed::High, None),
            None => {
                warn!("port: unknown speed {:#x}", hprt.read(HPRT::PSPD));
                (Speed::Unknown, None)
            }
        };

        if let Some((fslspcs, frivl)) = clock {
            let hcfg = self.regs.read_as::<HCFG::Register>(Reg::Hcfg);
            if !hcfg.matches_all(fslspcs) {
                info!("port: switching PHY clock for {:?}, HFIR = {}", speed, frivl);
                self.regs.write(Reg::Hcfg, fslspcs.modify(hcfg.get()));
                self.regs.write_fields(Reg::Hfir, HFIR::FRIVL.val(frivl));

                self.wait_till = now + self.config.reset_hold_us;
                let value = self.hprt_preserved();
                self.regs.write(Reg::Hprt, HPRT::PRST::SET.modify(value));
                return false;
            }
        }

        let value = self.hprt_preserved();
        self.regs.write(Reg::Hprt, HPRT::PENCHNG::SET.modify(value));
        self.prepare_fifo();
        self.reset_channels(bus);
        info!("port: enabled, {:?} speed", speed);
        bus.port_connected(speed);
        true
    }

    fn handle_rxflvl(&mut self, bus: &mut Bus) {
        let sts = self.regs.read_as::<GRXSTSP::Register>(Reg::Grxstsp);
        let n = sts.read(GRXSTSP::CHNUM) as u8;
        let len = sts.read(GRXSTSP::BCNT) as usize;
        let i = n as usize;

        if !sts.matches_all(GRXSTSP::PKTSTS::InData) || len == 0 {
            return;
        }

        let Some(slot) = self.channels.get(i).and_then(|ch| ch.urb) else {
            warn!("ch{i}: {len} bytes received without URB, dropped");
            fifo::drain(&self.regs, n, len);
            return;
        };
        let Some(pipe) = Pipe::of(bus, slot) else {
            fifo::drain(&self.regs, n, len);
            return;
        };

        if pipe.flags.contains(TransferFlags::NO_SHORT_PACKET) && len < pipe.ep_size as usize {
            debug!("ch{i}: short packet, {len} < {}", pipe.ep_size);
            fifo::drain(&self.regs, n, len);
            self.finish(bus, i, Err(TransferError::ShortPacket));
            return;
        }

        let tsiz = self.regs.read_as::<HCTSIZ::Register>(Reg::Hctsiz(n));
        if tsiz.read(HCTSIZ::PKTCNT) > 0 {
            // 还有包要收，继续使能通道
            self.regs.modify(Reg::Hcchar(n), HCCHAR::CHENA::SET);
        }

        let regs = &self.regs;
        match bus.packet_in(slot, len, |buf| fifo::read_packet(regs, n, buf)) {
            Ok(()) => {
                if pipe.tracks_toggle() {
                    if let Some(dev) = bus.urb_device_mut(slot) {
                        dev.flip_toggle(pipe.ep);
                    }
                }
                trace!("ch{i}: received {len} bytes");
            }
            Err(e) => {
                fifo::drain(&self.regs, n, len);
                self.finish(bus, i, Err(e));
            }
        }
    }

    fn handle_channel(&mut self, bus: &mut Bus, i: usize) {
        let n = i as u8;
        let raw = self.regs.read(Reg::Hcint(n)) & self.regs.read(Reg::Hcintmsk(n));
        let hcint = LocalCopy::<HCINT::Register>::new(raw);
        let state = self.channels[i].state;

        if hcint.is_set(HCINT::CHH) {
            self.regs.write_fields(Reg::Hcint(n), HCINT::CHH::SET);
            let ch = &mut self.channels[i];
            if state == ChannelState::Cancelled {
                ch.state = ChannelState::Free;
                self.regs.write(Reg::Hcintmsk(n), 0);
                trace!("ch{i}: halted, free");
            } else if ch.need_scheduling {
                trace!("ch{i}: halted, waiting for frame {}", ch.submit_frame);
            } else {
                warn!("ch{i}: halted unexpectedly in {:?}", state);
            }
            return;
        }

        if !state.is_busy() {
            warn!("ch{i}: interrupt {:#x} in {:?}", raw, state);
            self.regs.write(Reg::Hcint(n), raw);
            return;
        }

        let Some(slot) = self.channels[i].urb else {
            self.regs.write(Reg::Hcint(n), raw);
            return;
        };
        let Some(pipe) = Pipe::of(bus, slot) else {
            self.finish(bus, i, Err(TransferError::NoDevice));
            return;
        };

        if hcint.is_set(HCINT::NAK) {
            self.regs.write_fields(Reg::Hcint(n), HCINT::NAK::SET);
            if pipe.periodic() {
                let mut hcchar = self.advance_periodic(i, &pipe);
                let ch = &mut self.channels[i];
                if pipe.interval > 1 {
                    ch.need_scheduling = true;
                } else {
                    hcchar.modify(HCCHAR::CHENA::SET);
                }
                self.regs.write(Reg::Hcchar(n), hcchar.get());
                trace!("ch{i}: NAK, retry at frame {}", self.channels[i].submit_frame);
            } else {
                self.regs.modify(Reg::Hcchar(n), HCCHAR::CHENA::SET);
            }
            return;
        }

        if hcint.is_set(HCINT::ACK) {
            self.regs.write_fields(Reg::Hcint(n), HCINT::ACK::SET);
            let out = pipe.ep.direction() == Direction::Out;
            if pipe.tracks_toggle() && out {
                if let Some(dev) = bus.urb_device_mut(slot) {
                    dev.flip_toggle(pipe.ep);
                }
            }

            match pipe.ep_type {
                EndpointType::Control => {
                    if state == ChannelState::ControlDataOut {
                        self.push_packet(bus, i);
                    }
                }
                EndpointType::Bulk => {
                    if out {
                        self.push_packet(bus, i);
                    }
                }
                EndpointType::Interrupt | EndpointType::Isochronous => {
                    let mut hcchar = self.advance_periodic(i, &pipe);
                    let tsiz = self.regs.read_as::<HCTSIZ::Register>(Reg::Hctsiz(n));
                    if pipe.interval > 1 && tsiz.read(HCTSIZ::PKTCNT) > 0 {
                        self.channels[i].need_scheduling = true;
                        hcchar.modify(HCCHAR::CHENA::SET + HCCHAR::CHDIS::SET);
                    }
                    self.regs.write(Reg::Hcchar(n), hcchar.get());
                    if out {
                        self.push_packet(bus, i);
                    }
                }
            }
            return;
        }

        const ERRORS: [(u32, TransferError); 5] = [
            (HCINT::STALL::SET.value, TransferError::Stall),
            (HCINT::DTERR::SET.value, TransferError::DataToggle),
            (HCINT::BBERR::SET.value, TransferError::Babble),
            (HCINT::FRMOR::SET.value, TransferError::FrameOverrun),
            (HCINT::TXERR::SET.value, TransferError::Transaction),
        ];
        for (bit, err) in ERRORS {
            if raw & bit != 0 {
                self.regs.write(Reg::Hcint(n), bit);
                debug!("ch{i}: {:?}", err);
                self.finish(bus, i, Err(err));
                return;
            }
        }

        if hcint.is_set(HCINT::XFRC) {
            self.regs.write_fields(Reg::Hcint(n), HCINT::XFRC::SET);
            match state {
                ChannelState::ControlSetup => {
                    if pipe.length != 0 {
                        self.control_data_stage(bus, i, &pipe);
                    } else {
                        self.control_status_stage(i, &pipe);
                    }
                }
                ChannelState::ControlDataIn | ChannelState::ControlDataOut => {
                    self.control_status_stage(i, &pipe);
                }
                ChannelState::ControlStatusIn
                | ChannelState::ControlStatusOut
                | ChannelState::Callback => {
                    self.finish(bus, i, Ok(()));
                }
                ChannelState::Free | ChannelState::Cancelled => {}
            }
            return;
        }

        trace!("ch{i}: unhandled interrupt {:#x}", raw);
        self.regs.write(Reg::Hcint(n), raw);
    }
}

type LocalCopy<R> = tock_registers::LocalRegisterCopy<u32, R>;

impl<R: OtgRegs, const CHANNELS: usize> HostOp for DwcOtg<R, CHANNELS> {
    fn init(&mut self, now: u64) -> Result {
        info!("DWC OTG: init, {} channels", CHANNELS);
        self.core_reset()?;

        self.regs
            .write_fields(Reg::Gusbcfg, GUSBCFG::FHMOD::SET + GUSBCFG::PHYSEL::SET);
        // 重启 PHY 时钟
        self.regs.write(Reg::Pcgcctl, 0);
        self.regs.write(Reg::Gintsts, u32::MAX);

        let value = self.hprt_preserved();
        self.regs.write(Reg::Hprt, HPRT::PPWR::SET.modify(value));

        self.regs.write_fields(
            Reg::Gccfg,
            GCCFG::PWRDWN::SET
                + GCCFG::NOVBUSSENS::SET
                + GCCFG::VBUSASEN::SET
                + GCCFG::VBUSBSEN::SET,
        );

        self.channels = [Channel::IDLE; CHANNELS];
        self.wait_till = now;
        Ok(())
    }

    fn speed(&self) -> Speed {
        let hprt = self.regs.read_as::<HPRT::Register>(Reg::Hprt);
        if !hprt.is_set(HPRT::PCSTS) {
            return Speed::Unknown;
        }
        match hprt.read_as_enum(HPRT::PSPD) {
            Some(HPRT::PSPD::Value::High) => Speed::High,
            Some(HPRT::PSPD::Value::Full) => Speed::Full,
            Some(HPRT::PSPD::Value::Low) => Speed::Low,
            None => Speed::Unknown,
        }
    }

    fn poll(&mut self, bus: &mut Bus, now: u64) {
        if !self.poll_port(bus, now) {
            return;
        }

        self.schedule_channels();

        // FIFO 中的条目数不会超过其字数
        for _ in 0..self.config.rx_fifo_words.max(1) {
            let gintsts = self.regs.read_as::<GINTSTS::Register>(Reg::Gintsts);
            if !gintsts.is_set(GINTSTS::RXFLVL) {
                break;
            }
            self.handle_rxflvl(bus);
        }

        let gintsts = self.regs.read_as::<GINTSTS::Register>(Reg::Gintsts);
        if gintsts.is_set(GINTSTS::HCINT) {
            let haint = self.regs.read(Reg::Haint);
            for i in 0..CHANNELS {
                if haint & (1 << i) != 0 {
                    self.handle_channel(bus, i);
                }
            }
        }

        if gintsts.is_set(GINTSTS::IPXFR) {
            self.regs.write_fields(Reg::Gintsts, GINTSTS::IPXFR::SET);
            warn!("incomplete periodic transfer");
        }
    }

    fn reset(&mut self, now: u64) {
        info!("port: reset requested");
        self.wait_till = now + self.config.reset_hold_us;
        let value = self.hprt_preserved();
        self.regs.write(Reg::Hprt, HPRT::PRST::SET.modify(value));
    }

    fn submit(&mut self, bus: &mut Bus, slot: UrbSlot) {
        let Some(urb) = bus.urb(slot) else {
            return;
        };
        if urb.channel().is_some() {
            return;
        }
        let Some(pipe) = Pipe::of(bus, slot) else {
            return;
        };
        let Some(i) = self.free_channel() else {
            trace!("no free channel, URB {} stays queued", urb.id().get());
            return;
        };

        bus.attach_channel(slot, i as u8);
        self.channels[i].urb = Some(slot);

        match pipe.ep_type {
            EndpointType::Control => self.control_setup_stage(bus, i, &pipe),
            EndpointType::Bulk | EndpointType::Interrupt | EndpointType::Isochronous => {
                self.data_transfer(bus, i, &pipe)
            }
        }
    }

    fn cancel(&mut self, bus: &mut Bus, slot: UrbSlot) {
        if let Some(i) = self.channel_of(slot) {
            debug!("ch{i}: cancel");
            self.release(bus, i);
        } else {
            bus.detach_channel(slot);
        }
    }
}
