//! DWC OTG 主机模式寄存器定义
//! 基于 Synopsys DesignWare OTG 核心（STM32 OTG_FS/OTG_HS 使用的版本）

use core::ptr::NonNull;

use tock_registers::{LocalRegisterCopy, RegisterLongName, fields::FieldValue, register_bitfields};

/// 寄存器标识，通道寄存器带通道号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Gusbcfg,
    Grstctl,
    Gintsts,
    Grxstsp,
    Grxfsiz,
    Gnptxfsiz,
    Gccfg,
    Hptxfsiz,
    Hcfg,
    Hfir,
    Hfnum,
    Haint,
    Hprt,
    Hcchar(u8),
    Hcint(u8),
    Hcintmsk(u8),
    Hctsiz(u8),
    Pcgcctl,
    /// 通道 FIFO 窗口，读取总是弹出共享的接收 FIFO
    Fifo(u8),
}

impl Reg {
    /// 相对于核心基址的偏移
    pub const fn offset(self) -> usize {
        match self {
            Reg::Gusbcfg => 0x00C,
            Reg::Grstctl => 0x010,
            Reg::Gintsts => 0x014,
            Reg::Grxstsp => 0x020,
            Reg::Grxfsiz => 0x024,
            Reg::Gnptxfsiz => 0x028,
            Reg::Gccfg => 0x038,
            Reg::Hptxfsiz => 0x100,
            Reg::Hcfg => 0x400,
            Reg::Hfir => 0x404,
            Reg::Hfnum => 0x408,
            Reg::Haint => 0x414,
            Reg::Hprt => 0x440,
            Reg::Hcchar(n) => 0x500 + 0x20 * n as usize,
            Reg::Hcint(n) => 0x508 + 0x20 * n as usize,
            Reg::Hcintmsk(n) => 0x50C + 0x20 * n as usize,
            Reg::Hctsiz(n) => 0x510 + 0x20 * n as usize,
            Reg::Pcgcctl => 0xE00,
            Reg::Fifo(n) => 0x1000 + 0x1000 * n as usize,
        }
    }
}

/// 寄存器访问接口
///
/// 读操作可能有副作用（`GRXSTSP` 与 FIFO 读取会弹出数据）。
pub trait OtgRegs {
    fn read(&self, reg: Reg) -> u32;
    fn write(&mut self, reg: Reg, value: u32);

    fn read_as<R: RegisterLongName>(&self, reg: Reg) -> LocalRegisterCopy<u32, R> {
        LocalRegisterCopy::new(self.read(reg))
    }

    fn write_fields<R: RegisterLongName>(&mut self, reg: Reg, fields: FieldValue<u32, R>) {
        self.write(reg, fields.value);
    }

    fn modify<R: RegisterLongName>(&mut self, reg: Reg, fields: FieldValue<u32, R>) {
        let value = self.read(reg);
        self.write(reg, fields.modify(value));
    }
}

/// 内存映射的寄存器
pub struct MmioRegs {
    base: NonNull<u8>,
}

unsafe impl Send for MmioRegs {}

impl MmioRegs {
    /// # Safety
    ///
    /// `base` 必须指向 DWC OTG 核心寄存器区，且在对象存活期间保持映射
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    fn ptr(&self, reg: Reg) -> *mut u32 {
        unsafe { self.base.as_ptr().add(reg.offset()).cast() }
    }
}

impl OtgRegs for MmioRegs {
    fn read(&self, reg: Reg) -> u32 {
        unsafe { self.ptr(reg).read_volatile() }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        unsafe { self.ptr(reg).write_volatile(value) }
    }
}

register_bitfields![u32,
    pub GUSBCFG [
        /// 全速串行收发器选择
        PHYSEL OFFSET(6) NUMBITS(1) [],
        /// 强制主机模式
        FHMOD OFFSET(29) NUMBITS(1) [],
        /// 强制设备模式
        FDMOD OFFSET(30) NUMBITS(1) []
    ],

    pub GRSTCTL [
        /// 核心软复位
        CSRST OFFSET(0) NUMBITS(1) [],
        /// HCLK 软复位
        HSRST OFFSET(1) NUMBITS(1) [],
        /// 主机帧计数器复位
        FCRST OFFSET(2) NUMBITS(1) [],
        RXFFLSH OFFSET(4) NUMBITS(1) [],
        TXFFLSH OFFSET(5) NUMBITS(1) [],
        TXFNUM OFFSET(6) NUMBITS(5) [
            All = 0x10
        ],
        /// AHB 主机空闲
        AHBIDL OFFSET(31) NUMBITS(1) []
    ],

    pub GINTSTS [
        CMOD OFFSET(0) NUMBITS(1) [],
        SOF OFFSET(3) NUMBITS(1) [],
        /// 接收 FIFO 非空
        RXFLVL OFFSET(4) NUMBITS(1) [],
        /// 未完成的周期传输
        IPXFR OFFSET(21) NUMBITS(1) [],
        HPRTINT OFFSET(24) NUMBITS(1) [],
        /// 通道中断，详情见 HAINT
        HCINT OFFSET(25) NUMBITS(1) [],
        DISCINT OFFSET(29) NUMBITS(1) []
    ],

    pub GRXSTSP [
        CHNUM OFFSET(0) NUMBITS(4) [],
        BCNT OFFSET(4) NUMBITS(11) [],
        DPID OFFSET(15) NUMBITS(2) [],
        PKTSTS OFFSET(17) NUMBITS(4) [
            InData = 2,
            InComplete = 3,
            DataToggleError = 5,
            ChannelHalted = 7
        ]
    ],

    pub GCCFG [
        PWRDWN OFFSET(16) NUMBITS(1) [],
        VBUSASEN OFFSET(18) NUMBITS(1) [],
        VBUSBSEN OFFSET(19) NUMBITS(1) [],
        SOFOUTEN OFFSET(20) NUMBITS(1) [],
        NOVBUSSENS OFFSET(21) NUMBITS(1) []
    ],

    /// GNPTXFSIZ / HPTXFSIZ 共用布局
    pub TXFSIZ [
        /// 起始地址，单位字
        START OFFSET(0) NUMBITS(16) [],
        /// 深度，单位字
        DEPTH OFFSET(16) NUMBITS(16) []
    ],

    pub HCFG [
        /// FS/LS PHY 时钟选择
        FSLSPCS OFFSET(0) NUMBITS(2) [
            Clock48MHz = 1,
            Clock6MHz = 2
        ],
        FSLSS OFFSET(2) NUMBITS(1) []
    ],

    pub HFIR [
        FRIVL OFFSET(0) NUMBITS(16) []
    ],

    pub HFNUM [
        FRNUM OFFSET(0) NUMBITS(16) [],
        FTREM OFFSET(16) NUMBITS(16) []
    ],

    pub HPRT [
        /// 端口连接状态
        PCSTS OFFSET(0) NUMBITS(1) [],
        /// 端口连接检测 (W1C)
        PCDET OFFSET(1) NUMBITS(1) [],
        /// 端口使能 (W1C)
        PENA OFFSET(2) NUMBITS(1) [],
        /// 端口使能变化 (W1C)
        PENCHNG OFFSET(3) NUMBITS(1) [],
        POCA OFFSET(4) NUMBITS(1) [],
        /// 过流变化 (W1C)
        POCCHNG OFFSET(5) NUMBITS(1) [],
        PRES OFFSET(6) NUMBITS(1) [],
        PSUSP OFFSET(7) NUMBITS(1) [],
        /// 端口复位
        PRST OFFSET(8) NUMBITS(1) [],
        PLSTS OFFSET(10) NUMBITS(2) [],
        /// 端口供电
        PPWR OFFSET(12) NUMBITS(1) [],
        PTCTL OFFSET(13) NUMBITS(4) [],
        PSPD OFFSET(17) NUMBITS(2) [
            High = 0,
            Full = 1,
            Low = 2
        ]
    ],

    pub HCCHAR [
        MPSIZ OFFSET(0) NUMBITS(11) [],
        EPNUM OFFSET(11) NUMBITS(4) [],
        EPDIR OFFSET(15) NUMBITS(1) [
            Out = 0,
            In = 1
        ],
        LSDEV OFFSET(17) NUMBITS(1) [],
        EPTYP OFFSET(18) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        MCNT OFFSET(20) NUMBITS(2) [],
        DAD OFFSET(22) NUMBITS(7) [],
        ODDFRM OFFSET(29) NUMBITS(1) [],
        CHDIS OFFSET(30) NUMBITS(1) [],
        CHENA OFFSET(31) NUMBITS(1) []
    ],

    /// HCINT / HCINTMSK 共用布局，HCINT 为 W1C
    pub HCINT [
        XFRC OFFSET(0) NUMBITS(1) [],
        CHH OFFSET(1) NUMBITS(1) [],
        AHBERR OFFSET(2) NUMBITS(1) [],
        STALL OFFSET(3) NUMBITS(1) [],
        NAK OFFSET(4) NUMBITS(1) [],
        ACK OFFSET(5) NUMBITS(1) [],
        NYET OFFSET(6) NUMBITS(1) [],
        TXERR OFFSET(7) NUMBITS(1) [],
        BBERR OFFSET(8) NUMBITS(1) [],
        FRMOR OFFSET(9) NUMBITS(1) [],
        DTERR OFFSET(10) NUMBITS(1) []
    ],

    /// 控制传输的 SETUP 阶段使用 DPID=MData
    pub HCTSIZ [
        XFRSIZ OFFSET(0) NUMBITS(19) [],
        PKTCNT OFFSET(19) NUMBITS(10) [],
        DPID OFFSET(29) NUMBITS(2) [
            Data0 = 0,
            Data2 = 1,
            Data1 = 2,
            MData = 3
        ]
    ],

    pub PCGCCTL [
        STPPCLK OFFSET(0) NUMBITS(1) [],
        GATEHCLK OFFSET(1) NUMBITS(1) []
    ]
];

/// HCINT 全部已定义的中断位
pub const HCINT_ALL: u32 = 0x7FF;

/// HPRT 中写 1 清零的位，读-改-写时必须屏蔽
pub const HPRT_W1C: u32 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 5);
