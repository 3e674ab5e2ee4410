pub mod control_block;
pub mod state_dump;
pub mod vma;

pub use control_block::VictimControlBlock;
pub use vma::{find_syscall_vma, read_maps, Vma};
