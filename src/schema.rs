pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

-- One row per application-visible file waiting to be processed.
-- CONN_INFO carries the opaque connector handle used to answer the
-- originating recall event once the job has been worked.
CREATE TABLE IF NOT EXISTS JOB_QUEUE (
    OPERATION INT NOT NULL,            -- operation kind (0 = transparent recall)
    FILE_NAME CHAR(4096),              -- absolute path, NULL when the event carried none
    REQ_NUM INT NOT NULL,              -- request this job coalesces into
    TARGET_STATE INT NOT NULL,         -- resident or premigrated after the recall
    REPL_NUM INT,                      -- replica index, -1 when unset
    TAPE_POOL VARCHAR,                 -- unused by transparent recall
    FILE_SIZE BIGINT NOT NULL,
    FS_ID_H BIGINT NOT NULL,
    FS_ID_L BIGINT NOT NULL,
    I_GEN INT NOT NULL,
    I_NUM BIGINT NOT NULL,
    MTIME_SEC BIGINT NOT NULL,
    MTIME_NSEC BIGINT NOT NULL,
    LAST_UPD INT NOT NULL,
    TAPE_ID CHAR(9),
    FILE_STATE INT NOT NULL,
    START_BLOCK INT,                   -- first block of the file's extent on tape
    CONN_INFO BIGINT,
    CONSTRAINT JOB_QUEUE_UNIQUE_FILE_NAME UNIQUE (FILE_NAME, REPL_NUM),
    CONSTRAINT JOB_QUEUE_UNIQUE_UID UNIQUE (FS_ID_H, FS_ID_L, I_GEN, I_NUM, REPL_NUM)
);

-- The scheduler's unit of work: one request per tape with pending jobs.
CREATE TABLE IF NOT EXISTS REQUEST_QUEUE (
    OPERATION INT NOT NULL,
    REQ_NUM INT NOT NULL,
    TARGET_STATE INT,
    NUM_REPL INT,
    REPL_NUM INT,
    TAPE_POOL VARCHAR,
    TAPE_ID CHAR(9),
    TIME_ADDED INT NOT NULL,
    STATE INT NOT NULL,                -- 0 = new, 1 = in progress, 2 = completed
    CONSTRAINT REQUEST_QUEUE_UNIQUE UNIQUE (REQ_NUM, REPL_NUM, TAPE_POOL, TAPE_ID)
);

COMMIT;
"#;
