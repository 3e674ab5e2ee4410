//! Per-victim state dumps driven over the parasite control channel
//! (spec §4.5): itimers, signal dispositions, and credentials. Each
//! function dispatches the matching command and converts the raw
//! `libc`-shaped reply into the record the image stream actually stores.

use crate::error::Result;
use crate::image::{FileImage, ImageWriter};
use crate::parasite::commands::{CommandCode, DumpItimersArgs};
use crate::parasite::control;
use crate::victim::control_block::VictimControlBlock;
use serde::{Deserialize, Serialize};

/// One itimer's value, stored the way the image actually wants it: the
/// interval's seconds/microseconds kept apart (design note (a) — a
/// `dump_one_timer` copy in the original collapses both fields into the
/// seconds slot; this crate keeps them distinct).
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItimerRecord {
    pub isec: i64,
    pub iusec: i64,
    pub vsec: i64,
    pub vusec: i64,
}

fn dump_one_timer(val: &libc::itimerval) -> ItimerRecord {
    ItimerRecord {
        isec: val.it_interval.tv_sec as i64,
        iusec: val.it_interval.tv_usec as i64,
        vsec: val.it_value.tv_sec as i64,
        vusec: val.it_value.tv_usec as i64,
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItimersRecord {
    pub real: ItimerRecord,
    pub virt: ItimerRecord,
    pub prof: ItimerRecord,
}

/// `DUMP_ITIMERS` (spec §4.5): dispatch, then write one record covering all
/// three timers to the `Itimers` image stream.
pub fn dump_itimers(vcb: &mut VictimControlBlock, img: &mut FileImage) -> Result<()> {
    let args = DumpItimersArgs {
        real: unsafe { std::mem::zeroed() },
        virt: unsafe { std::mem::zeroed() },
        prof: unsafe { std::mem::zeroed() },
    };
    control::dispatch(vcb, CommandCode::DumpItimers, Some(&args))?;

    let addr_args = vcb.addr_args().expect("parasite not mapped: no addr_args");
    let reply = unsafe { std::ptr::read(addr_args as *const DumpItimersArgs) };

    let record = ItimersRecord {
        real: dump_one_timer(&reply.real),
        virt: dump_one_timer(&reply.virt),
        prof: dump_one_timer(&reply.prof),
    };
    img.write_record(&record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timerval(isec: i64, iusec: i64, vsec: i64, vusec: i64) -> libc::itimerval {
        libc::itimerval {
            it_interval: libc::timeval { tv_sec: isec as libc::time_t, tv_usec: iusec as libc::suseconds_t },
            it_value: libc::timeval { tv_sec: vsec as libc::time_t, tv_usec: vusec as libc::suseconds_t },
        }
    }

    #[test]
    fn dump_one_timer_keeps_sec_and_usec_distinct() {
        // Regression for design note (a): sec and usec must not be
        // conflated, so pick values where a sec-into-usec bug would show.
        let val = timerval(1, 2, 3, 4);
        let rec = dump_one_timer(&val);
        assert_eq!(rec, ItimerRecord { isec: 1, iusec: 2, vsec: 3, vusec: 4 });
    }

    #[test]
    fn dump_one_timer_does_not_copy_value_sec_into_usec_slots() {
        // The specific shape of the suspected bug: value tv_sec leaking
        // into both vsec and vusec.
        let val = timerval(0, 0, 7, 0);
        let rec = dump_one_timer(&val);
        assert_eq!(rec.vsec, 7);
        assert_eq!(rec.vusec, 0);
    }
}
