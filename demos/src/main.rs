use flagdb::dispatcher::Dispatcher;
use flagdb::error::Error;

fn main() {
    println!("Hello, flagdb!");

    run().unwrap();

    println!("Bye~");
}

/// Walks the literal end-to-end scenarios: a plain `Set`, three chained
/// commits rolled back in reverse order, a `Cancel` that discards flagged
/// writes but keeps plain ones, and a `Cancel`-after-`Commit` rejection.
fn run() -> Result<(), Error> {
    let dir = tempfile::TempDir::new()?;
    let db = Dispatcher::new(dir.path().to_path_buf())?;

    let chain = 1;
    let table = b"tbName";
    let key = b"key1";

    db.set(chain, table, key, b"value1")?;
    assert_eq!(db.get(chain, table, key)?, b"value1");
    println!("Set(key1, \"value1\") -> Get == \"value1\"");

    db.open_flag(chain, b"flag1")?;
    db.set_with_flag(chain, b"flag1", table, key, b"value1")?;
    db.commit(chain, b"flag1")?;

    db.open_flag(chain, b"flag2")?;
    db.set_with_flag(chain, b"flag2", table, key, b"")?;
    db.commit(chain, b"flag2")?;

    db.open_flag(chain, b"flag3")?;
    db.set_with_flag(chain, b"flag3", table, key, b"value3")?;
    db.commit(chain, b"flag3")?;

    db.rollback(chain, b"flag3")?;
    assert_eq!(db.get(chain, table, key)?, b"");
    assert!(!db.exist(chain, table, key)?);
    println!("Rollback(flag3) -> Get == \"\", Exist == false");

    db.rollback(chain, b"flag2")?;
    assert_eq!(db.get(chain, table, key)?, b"value1");
    println!("Rollback(flag2) -> Get == \"value1\"");

    db.rollback(chain, b"flag1")?;
    assert_eq!(db.get(chain, table, key)?, b"");
    println!("Rollback(flag1) -> Get == \"\"");

    db.open_flag(chain, b"flag4")?;
    db.set_with_flag(chain, b"flag4", table, key, b"value2")?;
    db.set(chain, table, key, b"plain-while-open")?;
    db.cancel(chain, b"flag4")?;
    assert_eq!(db.get(chain, table, key)?, b"plain-while-open");
    println!("Cancel(flag4) -> plain Set survives, flagged write discarded");

    db.open_flag(chain, b"flag5")?;
    db.set_with_flag(chain, b"flag5", table, key, b"v")?;
    db.commit(chain, b"flag5")?;
    let err = db.cancel(chain, b"flag5").unwrap_err();
    assert!(matches!(err, Error::NoOpenFlag));
    println!("Cancel(flag5) after Commit(flag5) -> NoOpenFlag, as expected");

    db.close();
    Ok(())
}
