//! Process-wide pool lifecycle: feed, drain, teardown, re-initialization.
//!
//! Kept in its own test binary: `shutdown` tears down the process-wide
//! pool, which would race the identity scenarios if run beside them.

use sqrl_identity::entropy;

#[test]
fn the_pool_feeds_drains_and_survives_teardown() {
    let pool = entropy::pool();

    // feed past the 512-bit target, then drain everything at once
    while pool.estimate() < 512 {
        pool.add(&[0x5a; 4096]);
    }
    let mut buf = [0_u8; 64];
    let received = pool.get_blocking(&mut buf, 512);
    assert!(received >= 512);
    // the drain zeroed the estimate; the collector may have ticked since
    assert!(pool.estimate() < 64);
    assert_ne!([0_u8; 64], buf);

    // expansion beyond one digest draws once and streams the rest
    while pool.estimate() < 512 {
        pool.add(&[0x5a; 4096]);
    }
    let mut wide = [0_u8; 100];
    assert_eq!(100, pool.bytes(&mut wide));
    assert_ne!(wide[..64], wide[36..]);

    entropy::shutdown();
    assert_eq!(0, pool.estimate());
    assert_eq!(0, pool.get_blocking(&mut buf, 8));
    pool.add(&[1; 64]);
    assert_eq!(0, pool.estimate());

    // teardown is not fatal: the next access re-initializes
    let pool = entropy::pool();
    while pool.estimate() < 64 {
        pool.add(&[0x5a; 256]);
    }
    let received = pool.get_blocking(&mut buf, 64);
    assert!(received >= 64);
}
