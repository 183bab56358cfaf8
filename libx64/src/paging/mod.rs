pub mod entry;
pub mod frame;
pub mod table;

#[allow(non_upper_case_globals)]
pub const Page4Kb: u64 = 4 * 1024;

#[allow(non_upper_case_globals)]
pub const Page2Mb: u64 = 2 * 1024 * 1024;

#[allow(non_upper_case_globals)]
pub const Page1Gb: u64 = 1024 * 1024 * 1024;

pub trait PageSize {}

pub struct PageCheck<const N: u64>;

impl PageSize for PageCheck<Page4Kb> {}
impl PageSize for PageCheck<Page2Mb> {}
impl PageSize for PageCheck<Page1Gb> {}

bitflags::bitflags! {
    /// Describes a page fault error code.
    ///
    /// This structure is defined by the following manual sections:
    ///   * AMD Volume 2: 8.4.2
    ///   * Intel Volume 3A: 4.7
    #[repr(transparent)]
    pub struct PageFaultErrorCode: u64 {
        /// If this flag is set, the page fault was caused by a page-protection violation,
        /// else the page fault was caused by a not-present page.
        const PROTECTION_VIOLATION = 1 << 0;

        /// If this flag is set, the memory access that caused the page fault was a write.
        const CAUSED_BY_WRITE = 1 << 1;

        /// If this flag is set, an access in user mode (CPL=3) caused the page fault.
        const USER_MODE = 1 << 2;

        /// If this flag is set, the page fault is a result of the processor reading a 1 from
        /// a reserved field within a page-translation-table entry.
        const MALFORMED_TABLE = 1 << 3;

        /// If this flag is set, the access that caused the page fault was an
        /// instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}
