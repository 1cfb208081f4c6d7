/// [`u8`]: **Port number**, identifies a port on a fabric adapter.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, identifies an adapter port within the
/// local routing domain.
pub type Lid = u16;

/// [`u8`]: **Global identifier (GID) index**, identifies a GID on a physical port.
pub type GidIndex = u8;

/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, identifies a packet in a flow.
pub type Psn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, authorizes remote access to a memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to identify a
/// posted operation when its completion is polled.
pub type WrId = u64;

/// [`u32`]: **Immediate data**, carried alongside a send or write operation
/// and delivered in the receive-side completion.
pub type ImmData = u32;
