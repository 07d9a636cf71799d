use std::sync::Arc;
use std::thread;

use ztl::error::Error;
use ztl::groups::ZtlOpts;
use ztl::media::{Geometry, ZNS_ALIGNMENT};
use ztl::mem_media::MemMedia;
use ztl::wca::WCA_SEC_PER_MCMD;
use ztl::zrocks::Zrocks;

fn geometry() -> Geometry {
    Geometry {
        ngrps: 8,
        pu_grp: 4,
        zn_pu: 128,
        sec_zn: 100_000,
        nbytes: 512,
        nbytes_oob: 0,
    }
}

fn opts(tag: &str) -> ZtlOpts {
    let dir = std::env::temp_dir().join(format!("zrocks-test-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    ZtlOpts {
        stats_dir: dir,
        ..ZtlOpts::default()
    }
}

fn init(tag: &str) -> Zrocks {
    let media = Arc::new(MemMedia::new(geometry()).unwrap());
    Zrocks::init(media, opts(tag)).unwrap()
}

fn pattern(buf: &mut [u8], seed: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = (seed
            .wrapping_mul(31)
            .wrapping_add(i as u64)
            .wrapping_mul(2_654_435_761)
            >> 16) as u8;
    }
}

#[test]
fn object_roundtrip_with_offset_reads() {
    let zrocks = init("roundtrip");
    let size = 64 * 1024;

    let mut wbuf = zrocks.alloc(size).unwrap();
    pattern(wbuf.as_mut_slice(), 42);
    zrocks.new_obj(7, wbuf.as_slice(), 0).unwrap();

    let mut rbuf = zrocks.alloc(size).unwrap();
    zrocks.read_obj(7, 0, rbuf.as_mut_slice()).unwrap();
    assert_eq!(rbuf.as_slice(), wbuf.as_slice());

    // A window in the middle of the object.
    let mut window = zrocks.alloc(2 * ZNS_ALIGNMENT).unwrap();
    zrocks
        .read_obj(7, 8 * ZNS_ALIGNMENT as u64, window.as_mut_slice())
        .unwrap();
    assert_eq!(
        window.as_slice(),
        &wbuf.as_slice()[8 * ZNS_ALIGNMENT..10 * ZNS_ALIGNMENT]
    );

    zrocks.exit().unwrap();
}

#[test]
fn rewriting_an_object_replaces_its_mapping() {
    let zrocks = init("rewrite");
    let size = 16 * 1024;

    let mut first = zrocks.alloc(size).unwrap();
    pattern(first.as_mut_slice(), 1);
    zrocks.new_obj(3, first.as_slice(), 0).unwrap();

    let mut second = zrocks.alloc(size).unwrap();
    pattern(second.as_mut_slice(), 2);
    zrocks.new_obj(3, second.as_slice(), 0).unwrap();

    let mut rbuf = zrocks.alloc(size).unwrap();
    zrocks.read_obj(3, 0, rbuf.as_mut_slice()).unwrap();
    assert_eq!(rbuf.as_slice(), second.as_slice());

    zrocks.exit().unwrap();
}

#[test]
fn deleted_objects_stop_resolving() {
    let zrocks = init("delete");
    let size = 8 * 1024;

    let mut wbuf = zrocks.alloc(size).unwrap();
    pattern(wbuf.as_mut_slice(), 9);
    zrocks.new_obj(11, wbuf.as_slice(), 0).unwrap();
    zrocks.delete(11).unwrap();

    let mut rbuf = zrocks.alloc(size).unwrap();
    assert_eq!(
        zrocks.read_obj(11, 0, rbuf.as_mut_slice()),
        Err(Error::ObjectDoesNotExist(11))
    );
    assert_eq!(zrocks.delete(11), Err(Error::ObjectDoesNotExist(11)));
    assert_eq!(zrocks.delete(999), Err(Error::ObjectDoesNotExist(999)));

    zrocks.exit().unwrap();
}

#[test]
fn raw_write_returns_offsets_the_caller_can_read_back() {
    let zrocks = init("raw");
    let geo = geometry();
    let size = 64 * 1024;

    let mut wbuf = zrocks.alloc(size).unwrap();
    pattern(wbuf.as_mut_slice(), 77);
    let offsets = zrocks.write(wbuf.as_slice(), 1).unwrap();

    // 128 sectors fragment into ceil(128 / 64) appends.
    let nsec = size as u64 / u64::from(geo.nbytes);
    assert_eq!(
        offsets.len() as u64,
        nsec.div_ceil(u64::from(WCA_SEC_PER_MCMD))
    );
    // Fragments of one zone land back to back.
    assert_eq!(
        offsets[1],
        offsets[0] + u64::from(WCA_SEC_PER_MCMD) * u64::from(geo.nbytes)
    );

    let mut rbuf = zrocks.alloc(size).unwrap();
    zrocks.read(offsets[0], rbuf.as_mut_slice()).unwrap();
    assert_eq!(rbuf.as_slice(), wbuf.as_slice());

    zrocks.exit().unwrap();
}

#[test]
fn alignment_violations_are_rejected() {
    let zrocks = init("align");

    let mut buf = zrocks.alloc(2 * ZNS_ALIGNMENT).unwrap();
    // Unaligned length.
    assert!(matches!(
        zrocks.new_obj(1, &buf.as_slice()[..100], 0),
        Err(Error::LengthNotAligned(100))
    ));
    // Unaligned buffer address.
    assert!(matches!(
        zrocks.new_obj(1, &buf.as_slice()[1..ZNS_ALIGNMENT + 1], 0),
        Err(Error::BufferNotAligned(_))
    ));
    // Unaligned read offset.
    assert!(zrocks.read(17, buf.as_mut_slice()).is_err());
    // Unknown level.
    assert!(matches!(
        zrocks.new_obj(1, buf.as_slice(), 64),
        Err(Error::InvalidLevel(64))
    ));

    zrocks.exit().unwrap();
}

/// 128 callers writing 1 MiB objects concurrently: every call succeeds, the
/// fragment shape matches the transfer bound, and every id resolves.
#[test]
fn parallel_object_writes_all_land() {
    let ids: u64 = 128;
    let size: usize = 1024 * 1024;
    let zrocks = Arc::new(init("parallel"));

    let mut handles = Vec::new();
    for id in 1..=ids {
        let zrocks = zrocks.clone();
        handles.push(thread::spawn(move || {
            let mut wbuf = zrocks.alloc(size).unwrap();
            pattern(wbuf.as_mut_slice(), id);
            zrocks.new_obj(id, wbuf.as_slice(), 0).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let geo = geometry();
    let nsec = size as u64 / u64::from(geo.nbytes);
    let nmcmd = nsec.div_ceil(u64::from(WCA_SEC_PER_MCMD));
    assert_eq!(
        zrocks.core().stats().get(ztl::stats::StatType::AppendMcmd),
        ids * nmcmd
    );

    // Every object is mapped and readable.
    let mut rbuf = zrocks.alloc(size).unwrap();
    let mut expected = vec![0u8; size];
    for id in 1..=ids {
        assert!(zrocks.core().map().read_entry(id).unwrap().flag());
        zrocks.read_obj(id, 0, rbuf.as_mut_slice()).unwrap();
        pattern(&mut expected, id);
        assert_eq!(rbuf.as_slice(), &expected[..]);
    }

    match Arc::try_unwrap(zrocks) {
        Ok(zrocks) => zrocks.exit().unwrap(),
        Err(_) => panic!("façade still shared"),
    }
}
