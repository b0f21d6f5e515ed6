use std::fmt;
use std::sync::atomic::{self, Ordering};

use common::io::{Io, Mmio};

use crate::usb;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved,
    /* Transfer */
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    /* Command */
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
    EvaluateContext,
    ResetEndpoint,
    StopEndpoint,
    SetTrDequeuePointer,
    ResetDevice,
    ForceEvent,
    NegotiateBandwidth,
    SetLatencyToleranceValue,
    GetPortBandwidth,
    ForceHeader,
    NoOpCmd,
    /* Reserved */
    GetExtendedProperty,
    SetExtendedProperty,
    Rsv26,
    Rsv27,
    Rsv28,
    Rsv29,
    Rsv30,
    Rsv31,
    /* Events */
    Transfer,
    CommandCompletion,
    PortStatusChange,
    BandwidthRequest,
    Doorbell,
    HostController,
    DeviceNotification,
    MfindexWrap,
    /* Reserved from 40 to 47, vendor devined from 48 to 63 */
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    DataBuffer = 0x02,
    BabbleDetected = 0x03,
    UsbTransaction = 0x04,
    Trb = 0x05,
    Stall = 0x06,
    Resource = 0x07,
    Bandwidth = 0x08,
    NoSlotsAvailable = 0x09,
    InvalidStreamType = 0x0A,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    ShortPacket = 0x0D,
    RingUnderrun = 0x0E,
    RingOverrun = 0x0F,
    VfEventRingFull = 0x10,
    Parameter = 0x11,
    BandwidthOverrun = 0x12,
    ContextState = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyTooLarge = 0x1D,
    Rsv30 = 0x1E,
    IsochBuffer = 0x1F,
    EventLost = 0x20,
    Undefined = 0x21,
    InvalidStreamId = 0x22,
    SecondaryBandwidth = 0x23,
    SplitTransaction = 0x24,
    /* Values from 37 to 191 are reserved */
    /* 192 to 223 are vendor defined errors */
    /* 224 to 255 are vendor defined information */
}

impl TrbCompletionCode {
    pub fn from_raw(code: u8) -> Option<Self> {
        use TrbCompletionCode::*;

        const CODES: [TrbCompletionCode; 37] = [
            Invalid,
            Success,
            DataBuffer,
            BabbleDetected,
            UsbTransaction,
            Trb,
            Stall,
            Resource,
            Bandwidth,
            NoSlotsAvailable,
            InvalidStreamType,
            SlotNotEnabled,
            EndpointNotEnabled,
            ShortPacket,
            RingUnderrun,
            RingOverrun,
            VfEventRingFull,
            Parameter,
            BandwidthOverrun,
            ContextState,
            NoPingResponse,
            EventRingFull,
            IncompatibleDevice,
            MissedService,
            CommandRingStopped,
            CommandAborted,
            Stopped,
            StoppedLengthInvalid,
            StoppedShortPacket,
            MaxExitLatencyTooLarge,
            Rsv30,
            IsochBuffer,
            EventLost,
            Undefined,
            InvalidStreamId,
            SecondaryBandwidth,
            SplitTransaction,
        ];
        CODES.get(usize::from(code)).copied()
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    NoData,
    Reserved,
    Out,
    In,
}


/// A Transfer Request Block: the 16-byte unit of every command, transfer and event ring.
///
/// The alignment keeps the fields naturally aligned wherever a TRB lives, including copies taken
/// off the event ring.
#[repr(C, align(16))]
pub struct Trb {
    pub data_low: Mmio<u32>,
    pub data_high: Mmio<u32>,
    pub status: Mmio<u32>,
    pub control: Mmio<u32>,
}
impl Clone for Trb {
    fn clone(&self) -> Self {
        Self {
            data_low: Mmio::new(self.data_low.read()),
            data_high: Mmio::new(self.data_high.read()),
            status: Mmio::new(self.status.read()),
            control: Mmio::new(self.control.read()),
        }
    }
}
impl Default for Trb {
    fn default() -> Self {
        Self {
            data_low: Mmio::new(0),
            data_high: Mmio::new(0),
            status: Mmio::new(0),
            control: Mmio::new(0),
        }
    }
}

pub const TRB_STATUS_COMPLETION_CODE_SHIFT: u8 = 24;
pub const TRB_STATUS_COMPLETION_CODE_MASK: u32 = 0xFF00_0000;

pub const TRB_STATUS_TRANSFER_LENGTH_SHIFT: u8 = 0;
pub const TRB_STATUS_TRANSFER_LENGTH_MASK: u32 = 0x00FF_FFFF;

pub const TRB_CONTROL_CYCLE_BIT: u32 = 1 << 0;
pub const TRB_CONTROL_TOGGLE_CYCLE_BIT: u32 = 1 << 1;
pub const TRB_CONTROL_ISP_BIT: u32 = 1 << 2;
pub const TRB_CONTROL_CHAIN_BIT: u32 = 1 << 4;
pub const TRB_CONTROL_IOC_BIT: u32 = 1 << 5;
pub const TRB_CONTROL_IDT_BIT: u32 = 1 << 6;
pub const TRB_CONTROL_BSR_BIT: u32 = 1 << 9;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;

pub const TRB_CONTROL_ENDPOINT_ID_MASK: u32 = 0x001F_0000;
pub const TRB_CONTROL_ENDPOINT_ID_SHIFT: u8 = 16;

pub const TRB_CONTROL_SLOT_ID_SHIFT: u8 = 24;

/// Port ID field of a Port Status Change event, in the parameter.
pub const TRB_PORT_ID_SHIFT: u8 = 24;

impl Trb {
    /// Writes all four words. The control word holds the cycle bit that hands the TRB to its
    /// consumer, so it is written last, after everything else is visible.
    pub fn set(&mut self, data: u64, status: u32, control: u32) {
        self.data_low.write(data as u32);
        self.data_high.write((data >> 32) as u32);
        self.status.write(status);
        atomic::fence(Ordering::Release);
        self.control.write(control);
    }

    pub fn read_data(&self) -> u64 {
        (self.data_low.read() as u64) | ((self.data_high.read() as u64) << 32)
    }

    pub fn completion_code(&self) -> u8 {
        (self.status.read() >> TRB_STATUS_COMPLETION_CODE_SHIFT) as u8
    }
    fn has_completion_trb_pointer(&self) -> bool {
        let code = self.completion_code();
        code != TrbCompletionCode::RingUnderrun as u8
            && code != TrbCompletionCode::RingOverrun as u8
            && code != TrbCompletionCode::VfEventRingFull as u8
    }
    /// The physical address of the command TRB a Command Completion event reports on.
    pub fn completion_trb_pointer(&self) -> Option<u64> {
        debug_assert_eq!(self.trb_type(), TrbType::CommandCompletion as u8);

        if self.has_completion_trb_pointer() {
            Some(self.read_data())
        } else {
            None
        }
    }
    /// The physical address of the transfer TRB a Transfer event reports on.
    pub fn transfer_event_trb_pointer(&self) -> Option<u64> {
        debug_assert_eq!(self.trb_type(), TrbType::Transfer as u8);

        if self.has_completion_trb_pointer() {
            Some(self.read_data())
        } else {
            None
        }
    }

    pub fn port_status_change_port_id(&self) -> u8 {
        debug_assert_eq!(self.trb_type(), TrbType::PortStatusChange as u8);
        ((self.read_data() >> TRB_PORT_ID_SHIFT) & 0xFF) as u8
    }

    pub fn event_slot(&self) -> u8 {
        (self.control.read() >> TRB_CONTROL_SLOT_ID_SHIFT) as u8
    }
    /// Returns the number of bytes that should have been transmitted, but weren't.
    pub fn transfer_length(&self) -> u32 {
        self.status.read() & TRB_STATUS_TRANSFER_LENGTH_MASK
    }
    pub fn endpoint_id(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_ENDPOINT_ID_MASK) >> TRB_CONTROL_ENDPOINT_ID_SHIFT)
            as u8
    }
    pub fn trb_type(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }
    pub fn cycle(&self) -> bool {
        self.control.readf(TRB_CONTROL_CYCLE_BIT)
    }
    pub fn chain(&self) -> bool {
        self.control.readf(TRB_CONTROL_CHAIN_BIT)
    }

    pub fn link(&mut self, address: u64, toggle: bool, cycle: bool) {
        assert_eq!(address & !0xF, address, "unaligned link target");
        self.set(
            address,
            0,
            ((TrbType::Link as u32) << TRB_CONTROL_TRB_TYPE_SHIFT)
                | (u32::from(toggle) << 1)
                | u32::from(cycle),
        );
    }

    /// Builds a command TRB. `endpoint_index` is zero-based and only encoded for the commands
    /// that address an endpoint.
    pub fn command(
        &mut self,
        parameter: u64,
        slot_id: u8,
        endpoint_index: u8,
        ty: TrbType,
        cycle: bool,
    ) {
        let endpoint_id = match ty {
            TrbType::ResetEndpoint | TrbType::StopEndpoint | TrbType::SetTrDequeuePointer => {
                assert!(endpoint_index < 31, "endpoint index {} out of range", endpoint_index);
                u32::from(endpoint_index + 1) << TRB_CONTROL_ENDPOINT_ID_SHIFT
            }
            _ => 0,
        };
        self.set(
            parameter,
            0,
            (u32::from(slot_id) << TRB_CONTROL_SLOT_ID_SHIFT)
                | endpoint_id
                | ((ty as u32) << TRB_CONTROL_TRB_TYPE_SHIFT)
                | u32::from(cycle),
        );
    }

    /// Address Device. With `bsr` set the slot only moves to Default, without a SET_ADDRESS
    /// going out on the bus.
    pub fn address_device(&mut self, input_context: u64, slot_id: u8, bsr: bool, cycle: bool) {
        assert_eq!(input_context & !0xF, input_context, "unaligned input context");
        self.set(
            input_context,
            0,
            (u32::from(slot_id) << TRB_CONTROL_SLOT_ID_SHIFT)
                | ((TrbType::AddressDevice as u32) << TRB_CONTROL_TRB_TYPE_SHIFT)
                | if bsr { TRB_CONTROL_BSR_BIT } else { 0 }
                | u32::from(cycle),
        );
    }

    pub fn setup(&mut self, setup: usb::Setup, transfer: TransferKind, cycle: bool) {
        self.set(
            u64::from_le_bytes(setup.to_bytes()),
            8,
            ((transfer as u32) << 16)
                | ((TrbType::SetupStage as u32) << TRB_CONTROL_TRB_TYPE_SHIFT)
                | TRB_CONTROL_IDT_BIT
                | u32::from(cycle),
        );
    }

    pub fn data(&mut self, buffer: u64, length: u32, input: bool, isp: bool, cycle: bool) {
        assert_eq!(length & TRB_STATUS_TRANSFER_LENGTH_MASK & 0x1_FFFF, length);
        self.set(
            buffer,
            length,
            (u32::from(input) << 16)
                | ((TrbType::DataStage as u32) << TRB_CONTROL_TRB_TYPE_SHIFT)
                | (u32::from(isp) << 2)
                | u32::from(cycle),
        );
    }

    pub fn status(&mut self, input: bool, ioc: bool, cycle: bool) {
        self.set(
            0,
            0,
            (u32::from(input) << 16)
                | ((TrbType::StatusStage as u32) << TRB_CONTROL_TRB_TYPE_SHIFT)
                | (u32::from(ioc) << 5)
                | u32::from(cycle),
        );
    }

    pub fn is_command_trb(&self) -> bool {
        let valid_trb_types = [
            TrbType::NoOpCmd as u8,
            TrbType::EnableSlot as u8,
            TrbType::DisableSlot as u8,
            TrbType::AddressDevice as u8,
            TrbType::ConfigureEndpoint as u8,
            TrbType::EvaluateContext as u8,
            TrbType::ResetEndpoint as u8,
            TrbType::StopEndpoint as u8,
            TrbType::SetTrDequeuePointer as u8,
            TrbType::ResetDevice as u8,
            TrbType::ForceEvent as u8,
            TrbType::NegotiateBandwidth as u8,
            TrbType::SetLatencyToleranceValue as u8,
            TrbType::GetPortBandwidth as u8,
            TrbType::ForceHeader as u8,
            TrbType::GetExtendedProperty as u8,
            TrbType::SetExtendedProperty as u8,
        ];
        valid_trb_types.contains(&self.trb_type())
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}

impl fmt::Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({:>016X}, {:>08X}, {:>08X})",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}
