use std::time::Duration;

use sealpool::counters::CounterBank;
use tempfile::tempdir;

fn interval() -> Duration {
    Duration::from_millis(5)
}

#[test]
fn create_inc_and_set() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let bank = CounterBank::open(&dir.path().join("counters"), interval())?;

    assert!(!bank.exists(0));
    bank.create_at(0, 10);
    assert!(bank.exists(0));
    assert_eq!(bank.get(0), 10);

    // inc hands out the previous value, so the counter always holds the
    // next value to be assigned
    assert_eq!(bank.inc(0), 10);
    assert_eq!(bank.inc(0), 11);
    assert_eq!(bank.get(0), 12);

    bank.set(0, 100);
    assert_eq!(bank.get(0), 100);

    bank.close();
    Ok(())
}

#[test]
fn values_survive_reopen() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("counters");

    {
        let bank = CounterBank::open(&path, interval())?;
        bank.create_at(0, 0);
        bank.create_at(5, 7);
        for _ in 0..3 {
            bank.inc(5);
        }
        bank.persist_all();
        bank.close();
    }

    let bank = CounterBank::open(&path, interval())?;
    assert!(bank.exists(0));
    assert!(bank.exists(5));
    assert_eq!(bank.get(5), 10, "Expected 7 + 3 increments to persist");
    bank.close();
    Ok(())
}

#[test]
fn stability_lags_behind_live_values() -> sealpool::Result<()> {
    let dir = tempdir()?;
    // a long flush interval keeps the watermark behind until we force it
    let bank = CounterBank::open(&dir.path().join("counters"), Duration::from_secs(30))?;
    bank.create_at(0, 0);
    bank.persist_all();

    bank.set(0, 42);
    assert!(
        !bank.stable_at_least(0, 42),
        "a freshly set value must not be stable before a flush"
    );
    assert!(bank.stable_at_least(0, 0));

    bank.persist_all();
    assert!(bank.stable_at_least(0, 42));
    bank.close();
    Ok(())
}

#[test]
fn wait_stable_terminates() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let bank = CounterBank::open(&dir.path().join("counters"), interval())?;
    bank.create_at(3, 0);
    for _ in 0..50 {
        bank.inc(3);
    }
    bank.wait_stable(3, 50);
    assert!(bank.stable_at_least(3, 50));
    bank.close();
    Ok(())
}

#[test]
fn close_flushes_final_state() -> sealpool::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("counters");
    {
        // interval long enough that only the shutdown flush can persist
        let bank = CounterBank::open(&path, Duration::from_secs(30))?;
        bank.create_at(1, 0);
        bank.set(1, 77);
        bank.close();
    }
    let bank = CounterBank::open(&path, interval())?;
    assert_eq!(bank.get(1), 77);
    bank.close();
    Ok(())
}
